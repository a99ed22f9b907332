//! ClusterBuildStrategy catalog, installed once the build webhook is serving.

use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use tracing::{info, warn};

use shp_apply::ManifestSet;
use shp_kubehub::{from_json, ClusterClient, ListQuery};

use crate::crd_exists;
use crate::error::ControllerError;

pub const STRATEGY_CRD: &str = "clusterbuildstrategies.shipwright.io";
pub const WEBHOOK_LABEL: (&str, &str) = ("name", "shp-build-webhook");
pub const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// `Ok(true)` asks for a later pass (the strategy CRD is not installed yet), `Ok(false)` means
/// the catalog was applied. Errors always imply a retry.
pub async fn reconcile(
    client: &dyn ClusterClient,
    manifest: &ManifestSet,
    target_namespace: &str,
    timeout: Duration,
) -> Result<bool, ControllerError> {
    if !crd_exists(client, STRATEGY_CRD).await? {
        info!(crd = STRATEGY_CRD, "strategy CRD not installed yet");
        return Ok(true);
    }
    wait_for_webhook(client, target_namespace, timeout).await?;
    manifest.apply(client).await?;
    Ok(false)
}

/// Running, not terminating, and Ready.
pub fn is_pod_ready(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return false;
    }
    let Some(status) = pod.status.as_ref() else { return false };
    if status.phase.as_deref() != Some("Running") {
        return false;
    }
    status.conditions.as_deref().unwrap_or_default().iter().any(|c| c.type_ == "Ready" && c.status == "True")
}

/// Poll the webhook pods every [`POLL_INTERVAL`] until one is ready, giving up after `timeout`.
/// The first check runs immediately; list failures are logged and polled again.
pub async fn wait_for_webhook(client: &dyn ClusterClient, namespace: &str, timeout: Duration) -> Result<(), ControllerError> {
    let query = ListQuery::of::<Pod>().in_namespace(namespace).with_label(WEBHOOK_LABEL.0, WEBHOOK_LABEL.1);
    let poll = async {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            ticker.tick().await;
            match client.list(&query).await {
                Ok(pods) if pods.is_empty() => info!(namespace, "waiting for webhook pod to be ready and running"),
                Ok(pods) => {
                    if pods.into_iter().filter_map(|p| from_json::<Pod>(p).ok()).any(|p| is_pod_ready(&p)) {
                        return;
                    }
                }
                Err(e) => warn!(error = %e, "listing webhook pods, retrying in {:?}", POLL_INTERVAL),
            }
        }
    };
    tokio::time::timeout(timeout, poll).await.map_err(|_| ControllerError::WebhookTimeout(timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shp_kubehub::memory::{MemoryCluster, Verb};

    pub(crate) fn webhook_pod(ns: &str, phase: &str, ready: &str) -> serde_json::Value {
        json!({
            "apiVersion": "v1", "kind": "Pod",
            "metadata": {"name": format!("shp-build-webhook-{}", phase.to_lowercase()), "namespace": ns, "labels": {"name": "shp-build-webhook"}},
            "status": {"phase": phase, "conditions": [{"type": "Ready", "status": ready}]}
        })
    }

    fn strategies() -> ManifestSet {
        ManifestSet::from_yaml_str(
            "strategies",
            "apiVersion: shipwright.io/v1beta1\nkind: ClusterBuildStrategy\nmetadata:\n  name: buildah\nspec:\n  steps: []\n",
        )
        .unwrap()
    }

    #[test]
    fn readiness_needs_running_and_ready() {
        let ok: Pod = from_json(webhook_pod("ns1", "Running", "True")).unwrap();
        assert!(is_pod_ready(&ok));
        let pending: Pod = from_json(webhook_pod("ns1", "Pending", "True")).unwrap();
        assert!(!is_pod_ready(&pending));
        let unready: Pod = from_json(webhook_pod("ns1", "Running", "False")).unwrap();
        assert!(!is_pod_ready(&unready));
    }

    #[tokio::test]
    async fn missing_crd_requeues_without_error() {
        let c = MemoryCluster::new();
        assert!(reconcile(&c, &strategies(), "ns1", Duration::from_secs(1)).await.unwrap());
        assert!(c.objects_of_kind("ClusterBuildStrategy").is_empty());
    }

    #[tokio::test]
    async fn ready_webhook_installs_catalog() {
        let c = MemoryCluster::new();
        c.insert(json!({"apiVersion": "apiextensions.k8s.io/v1", "kind": "CustomResourceDefinition", "metadata": {"name": STRATEGY_CRD}}));
        c.insert(webhook_pod("ns1", "Running", "True"));
        assert!(!reconcile(&c, &strategies(), "ns1", Duration::from_secs(1)).await.unwrap());
        assert_eq!(c.objects_of_kind("ClusterBuildStrategy").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_when_no_pod_becomes_ready() {
        let c = MemoryCluster::new();
        c.insert(webhook_pod("ns1", "Pending", "False"));
        c.insert(webhook_pod("other", "Running", "True"));
        let err = wait_for_webhook(&c, "ns1", Duration::from_secs(35)).await.unwrap_err();
        assert!(matches!(err, ControllerError::WebhookTimeout(d) if d == Duration::from_secs(35)));
    }

    #[tokio::test(start_paused = true)]
    async fn list_errors_keep_polling() {
        let c = MemoryCluster::new();
        c.insert(webhook_pod("ns1", "Running", "True"));
        c.fail(Verb::List, "Pod", "apiserver unavailable");
        let wait = wait_for_webhook(&c, "ns1", Duration::from_secs(60));
        let recover = async {
            tokio::time::sleep(Duration::from_secs(15)).await;
            c.clear_failures();
        };
        let (res, ()) = tokio::join!(wait, recover);
        res.unwrap();
    }
}
