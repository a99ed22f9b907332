use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser;
use futures::StreamExt;
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt, ResourceExt};
use tracing::{debug, error, info, warn};

use shp_controller::{register_kinds, ControllerError, Engine, Manifests, Outcome, Retry};
use shp_core::config::{DATA_PATH_ENV, MANAGED_WEBHOOK_CERTS_ENV, PLATFORM_ENV, TIMEOUT_ENV};
use shp_core::{OperatorConfig, ShipwrightBuild};
use shp_kubehub::{KindRegistry, KubeCluster};

const IMMEDIATE_REQUEUE: Duration = Duration::from_secs(1);
const BACKOFF_REQUEUE: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "shipwright-operator", version, about = "Installs and manages Shipwright Build from ShipwrightBuild resources")]
struct Cli {
    /// Print the ShipwrightBuild CRD as YAML and exit
    #[arg(long)]
    crd: bool,

    /// Directory holding release.yaml, certificates.yaml and samples/buildstrategy
    #[arg(long = "data-path", env = DATA_PATH_ENV)]
    data_path: Option<PathBuf>,

    /// Issue webhook certificates through cert-manager
    #[arg(long = "use-managed-webhook-certs", env = MANAGED_WEBHOOK_CERTS_ENV)]
    managed_webhook_certs: Option<String>,

    /// Upper bound for the webhook readiness wait, e.g. "5m" or "90s"
    #[arg(long = "timeout", env = TIMEOUT_ENV)]
    timeout: Option<String>,

    /// Target platform: kubernetes or openshift
    #[arg(long = "platform", env = PLATFORM_ENV)]
    platform: Option<String>,

    /// Prometheus exporter listen address (host:port)
    #[arg(long = "metrics-addr", env = "SHP_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,
}

impl Cli {
    /// Process environment overlaid with explicit flags. `IMAGE_SHIPWRIGHT_*` only come from the environment.
    fn operator_config(&self) -> Result<OperatorConfig> {
        let mut vars: Vec<(String, String)> = std::env::vars().collect();
        if let Some(p) = &self.data_path {
            vars.push((DATA_PATH_ENV.into(), p.display().to_string()));
        }
        let flags = [
            (MANAGED_WEBHOOK_CERTS_ENV, &self.managed_webhook_certs),
            (TIMEOUT_ENV, &self.timeout),
            (PLATFORM_ENV, &self.platform),
        ];
        for (name, value) in flags {
            if let Some(v) = value {
                vars.push((name.into(), v.clone()));
            }
        }
        OperatorConfig::from_vars(vars).context("reading operator configuration")
    }
}

fn init_tracing() {
    let env = std::env::var("SHP_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics(addr: Option<SocketAddr>) {
    let Some(sock) = addr else { return };
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    match builder.with_http_listener(sock).install() {
        Ok(_) => info!(addr = %sock, "Prometheus metrics exporter listening"),
        Err(e) => warn!(error = %e, "failed to install metrics exporter"),
    }
}

/// Map an engine outcome onto the runtime's scheduling decision.
fn to_action(outcome: Outcome) -> Result<Action, ControllerError> {
    match outcome.into_result()? {
        None => Ok(Action::await_change()),
        Some(d) if d.is_zero() => Ok(Action::requeue(IMMEDIATE_REQUEUE)),
        Some(d) => Ok(Action::requeue(d)),
    }
}

fn retry_delay(err: &ControllerError) -> Duration {
    match err.retry() {
        Retry::Immediate => IMMEDIATE_REQUEUE,
        Retry::After(d) => d,
        Retry::Backoff => BACKOFF_REQUEUE,
    }
}

async fn reconcile(build: Arc<ShipwrightBuild>, engine: Arc<Engine>) -> Result<Action, ControllerError> {
    to_action(engine.reconcile(&build.name_any()).await)
}

fn error_policy(build: Arc<ShipwrightBuild>, err: &ControllerError, _engine: Arc<Engine>) -> Action {
    let delay = retry_delay(err);
    error!(name = %build.name_any(), error = %err, requeue = ?delay, "reconcile failed");
    Action::requeue(delay)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.crd {
        print!("{}", serde_yaml::to_string(&ShipwrightBuild::crd()).context("serializing CRD")?);
        return Ok(());
    }

    init_tracing();
    init_metrics(cli.metrics_addr);

    let config = Arc::new(cli.operator_config()?);
    info!(
        data_path = %config.data_path.display(),
        managed_webhook_certs = config.managed_webhook_certs,
        timeout = ?config.webhook_timeout,
        platform = ?config.platform,
        images = config.images.len(),
        "starting shipwright operator"
    );
    let manifests = Arc::new(Manifests::load(&config).context("loading manifests")?);

    let registry = Arc::new(KindRegistry::with_builtins());
    register_kinds(&registry);
    let client = Client::try_default().await.context("building kube client")?;
    let cluster = Arc::new(KubeCluster::new(client.clone(), registry.clone()));
    let engine = Arc::new(Engine::new(cluster, registry, config, manifests));

    let builds: Api<ShipwrightBuild> = Api::all(client);
    Controller::new(builds, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, engine)
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => debug!(object = %obj, ?action, "reconciled"),
                Err(e) => warn!(error = %e, "controller event"),
            }
        })
        .await;
    info!("shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_map_to_actions() {
        assert_eq!(to_action(Outcome::NoRequeue).unwrap(), Action::await_change());
        assert_eq!(to_action(Outcome::RequeueImmediate).unwrap(), Action::requeue(IMMEDIATE_REQUEUE));
        let d = Duration::from_secs(5);
        assert_eq!(to_action(Outcome::RequeueAfter(d)).unwrap(), Action::requeue(d));
        let err = to_action(Outcome::Error(ControllerError::PrerequisiteMissing("tekton operator"))).unwrap_err();
        assert_eq!(err.to_string(), "tekton operator not installed");
    }

    #[test]
    fn retry_hints_pick_the_delay() {
        assert_eq!(retry_delay(&ControllerError::PrerequisiteMissing("cert-manager operator")), BACKOFF_REQUEUE);
        assert_eq!(retry_delay(&ControllerError::DependencyUnready("upgrading".into())), Duration::from_secs(5));
        let rejected = ControllerError::Cluster(shp_kubehub::ClusterError::Rejected("forbidden".into()));
        assert_eq!(retry_delay(&rejected), IMMEDIATE_REQUEUE);
    }

    #[test]
    fn flags_override_environment() {
        let cli = Cli::parse_from([
            "shipwright-operator",
            "--data-path",
            "/kodata",
            "--use-managed-webhook-certs",
            "true",
            "--timeout",
            "90s",
            "--platform",
            "openshift",
        ]);
        let cfg = cli.operator_config().unwrap();
        assert_eq!(cfg.data_path, PathBuf::from("/kodata"));
        assert!(cfg.managed_webhook_certs);
        assert_eq!(cfg.webhook_timeout, Duration::from_secs(90));
        assert_eq!(cfg.platform, shp_core::Platform::OpenShift);
    }

    #[test]
    fn crd_describes_cluster_scoped_resource() {
        let crd = ShipwrightBuild::crd();
        assert_eq!(crd.spec.scope, "Cluster");
        assert_eq!(crd.spec.names.kind, "ShipwrightBuild");
    }
}
