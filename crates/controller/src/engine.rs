//! One reconcile pass for a ShipwrightBuild.
//!
//! Init -> target namespace -> dependencies -> [certificates] -> release manifest -> finalizer
//! -> strategy catalog -> Ready, or teardown whenever the deletion timestamp is set. Every step
//! tolerates having already happened in an earlier pass.

use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::Namespace;
use metrics::{counter, histogram};
use serde_json::json;
use tracing::{field, info, info_span, Instrument, Span};

use shp_apply::{AnnotationPolicy, ManifestSet, Pipeline, Transform, CRD_KIND};
use shp_core::config::IMAGE_PREFIX;
use shp_core::{cert_manager_inject_value, OperatorConfig, Platform, ShipwrightBuild, CERT_MANAGER_INJECT_ANNOTATION};
use shp_kubehub::{get_as, ClusterClient, ClusterError, KindRegistry, ObjectRef};

use crate::error::ControllerError;
use crate::manifests::Manifests;
use crate::tekton::DependencyState;
use crate::{buildstrategy, certmanager, finalizer, status, tekton, Outcome};

/// CRD descriptions are clipped to this many characters.
pub const MAX_DESCRIPTION: usize = 50;

/// Pause before checking again for the strategy CRD.
pub const STRATEGY_REQUEUE: Duration = Duration::from_secs(5);

/// Pause after creating the TektonConfig, while the Tekton Operator installs Pipelines.
pub const DEPENDENCY_REQUEUE: Duration = Duration::from_secs(10);

pub struct Engine {
    client: Arc<dyn ClusterClient>,
    registry: Arc<KindRegistry>,
    config: Arc<OperatorConfig>,
    manifests: Arc<Manifests>,
}

impl Engine {
    pub fn new(client: Arc<dyn ClusterClient>, registry: Arc<KindRegistry>, config: Arc<OperatorConfig>, manifests: Arc<Manifests>) -> Self {
        Self { client, registry, config, manifests }
    }

    /// Transforms for the release manifest targeting `ns`.
    pub fn release_pipeline(&self, ns: &str) -> Pipeline {
        let mut p = Pipeline::new()
            .then(Transform::inject_namespace(ns, self.registry.cluster_scoped_kinds()))
            .then(Transform::replace_images(&self.config.images, Some(IMAGE_PREFIX)));
        if self.config.managed_webhook_certs && self.config.platform == Platform::Kubernetes {
            p.push(Transform::inject_annotation(
                CERT_MANAGER_INJECT_ANNOTATION,
                &cert_manager_inject_value(ns),
                AnnotationPolicy::Overwrite,
                &[CRD_KIND],
            ));
        }
        p.push(Transform::truncate_field("description", MAX_DESCRIPTION, &[CRD_KIND]));
        p
    }

    /// Reconcile the ShipwrightBuild called `name`.
    pub async fn reconcile(&self, name: &str) -> Outcome {
        let span = info_span!("reconcile", name, target_namespace = field::Empty);
        let t0 = Instant::now();
        counter!("reconcile_total", 1u64);
        let outcome = match self.run(name).instrument(span).await {
            Ok(o) => o,
            Err(e) => Outcome::Error(e),
        };
        if outcome.is_error() {
            counter!("reconcile_errors", 1u64);
        }
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        outcome
    }

    async fn run(&self, name: &str) -> Result<Outcome, ControllerError> {
        match self.converge(name).await {
            Err(e) if build_vanished(&e, name) => {
                info!(error = %e, "resource deleted during reconcile");
                Ok(Outcome::NoRequeue)
            }
            other => other,
        }
    }

    async fn converge(&self, name: &str) -> Result<Outcome, ControllerError> {
        let client = self.client.as_ref();
        let Some(mut build) = get_as::<ShipwrightBuild>(client, &ObjectRef::of::<ShipwrightBuild>(name, None)).await? else {
            info!("resource not found");
            return Ok(Outcome::NoRequeue);
        };
        let ns = build.target_namespace().to_string();
        Span::current().record("target_namespace", ns.as_str());

        if build.is_deleting() {
            return self.teardown(&build, &ns).await;
        }
        if build.ready_condition().is_none() {
            build = status::mark_init(client, &build).await?;
        }

        match self.install(&build, &ns).await {
            Ok(Some(outcome)) => Ok(outcome),
            Ok(None) => {
                status::mark_ready(client, &build_latest(client, &build).await?).await?;
                info!("all done");
                Ok(Outcome::NoRequeue)
            }
            Err(e) => {
                if !build_vanished(&e, name) {
                    status::record_failure(client, &build_latest(client, &build).await.unwrap_or(build), &e).await;
                }
                Err(e)
            }
        }
    }

    /// Everything between init and Ready. `Some` short-circuits the pass with that outcome.
    async fn install(&self, build: &ShipwrightBuild, ns: &str) -> Result<Option<Outcome>, ControllerError> {
        let client = self.client.as_ref();

        ensure_namespace(client, ns).await?;

        let state = tekton::resolve(client).await?.require()?;
        info!(?state, "tekton dependency resolved");
        if state == DependencyState::ConfiguredAbsent {
            status::mark_waiting(client, build, "Waiting for the Tekton Operator to install Tekton Pipelines").await?;
            return Ok(Some(Outcome::RequeueAfter(DEPENDENCY_REQUEUE)));
        }

        if self.config.managed_webhook_certs {
            let empty = ManifestSet::default();
            let certs = self.manifests.certificates.as_ref().unwrap_or(&empty);
            certmanager::reconcile(client, &self.registry, certs, ns).await?;
        }

        let release = self.manifests.release.without_kind("Namespace").transform(&self.release_pipeline(ns))?;
        info!(objects = release.len(), "applying manifest's resources");
        release.apply(client).await?;

        let build = finalizer::set_finalizer(client, build).await?;

        if buildstrategy::reconcile(client, &self.manifests.strategies, ns, self.config.webhook_timeout).await? {
            status::mark_waiting(client, &build, "Waiting for the ClusterBuildStrategy CRD").await?;
            return Ok(Some(Outcome::RequeueAfter(STRATEGY_REQUEUE)));
        }
        Ok(None)
    }

    async fn teardown(&self, build: &ShipwrightBuild, ns: &str) -> Result<Outcome, ControllerError> {
        let client = self.client.as_ref();
        if !build.has_finalizer() {
            info!("finalizers removed, deletion of manifests completed");
            return Ok(Outcome::NoRequeue);
        }
        info!("deleting manifests");
        let release = self.manifests.release.without_kind("Namespace").transform(&self.release_pipeline(ns))?;
        release.delete(client, true).await.map_err(ControllerError::Teardown)?;
        finalizer::unset_finalizer(client, build).await?;
        info!("all removed");
        Ok(Outcome::NoRequeue)
    }
}

/// The ShipwrightBuild called `name` itself answered NotFound on a write.
fn build_vanished(err: &ControllerError, name: &str) -> bool {
    let own = ObjectRef::of::<ShipwrightBuild>(name, None);
    matches!(err, ControllerError::Cluster(ClusterError::NotFound { kind, name: n }) if *kind == own.kind && *n == own.name)
}

/// Current state of `build` as stored; falls back to `build` if it disappeared.
async fn build_latest(client: &dyn ClusterClient, build: &ShipwrightBuild) -> Result<ShipwrightBuild, ClusterError> {
    let name = build.metadata.name.as_deref().unwrap_or_default();
    Ok(get_as(client, &ObjectRef::of::<ShipwrightBuild>(name, None)).await?.unwrap_or_else(|| build.clone()))
}

/// Create the namespace when absent; a concurrent create is fine.
pub async fn ensure_namespace(client: &dyn ClusterClient, ns: &str) -> Result<(), ClusterError> {
    if client.get(&ObjectRef::of::<Namespace>(ns, None)).await?.is_some() {
        return Ok(());
    }
    let obj = json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": ns}});
    match client.create(&obj).await {
        Ok(_) => {
            info!(namespace = ns, "created target namespace");
            Ok(())
        }
        Err(e) if e.is_already_exists() => Ok(()),
        Err(e) => Err(e),
    }
}
