//! Managed webhook certificates through cert-manager.

use tracing::info;

use shp_apply::{ManifestSet, Pipeline, Transform};
use shp_kubehub::{ClusterClient, KindRegistry};

use crate::crd_exists;
use crate::error::ControllerError;

pub const CERTIFICATES_CRD: &str = "certificates.cert-manager.io";
pub const CERT_MANAGER_OPERATOR_CRD: &str = "certmanagers.operator.openshift.io";

/// In-cluster DNS names the webhook certificate must cover.
pub fn cert_domains(target_namespace: &str) -> Vec<String> {
    vec![format!("shp-build-webhook.{}.svc", target_namespace)]
}

pub fn pipeline(registry: &KindRegistry, target_namespace: &str) -> Pipeline {
    Pipeline::new()
        .then(Transform::inject_namespace(target_namespace, registry.cluster_scoped_kinds()))
        .then(Transform::inject_dns_names(cert_domains(target_namespace)))
}

/// Apply the certificate manifest once cert-manager (or its operator) is installed.
/// Neither being present is a hard error carrying no retry hint.
pub async fn reconcile(
    client: &dyn ClusterClient,
    registry: &KindRegistry,
    manifest: &ManifestSet,
    target_namespace: &str,
) -> Result<(), ControllerError> {
    if !crd_exists(client, CERTIFICATES_CRD).await? && !crd_exists(client, CERT_MANAGER_OPERATOR_CRD).await? {
        return Err(ControllerError::PrerequisiteMissing("cert-manager operator"));
    }
    let set = manifest.without_kind("Namespace").transform(&pipeline(registry, target_namespace))?;
    set.apply(client).await?;
    info!(namespace = target_namespace, objects = set.len(), "webhook certificates applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shp_kubehub::memory::MemoryCluster;
    use shp_kubehub::ObjectRef;

    const CERTS: &str = r#"
apiVersion: cert-manager.io/v1
kind: Issuer
metadata:
  name: selfsigned-issuer
  namespace: shipwright-build
spec:
  selfSigned: {}
---
apiVersion: cert-manager.io/v1
kind: Certificate
metadata:
  name: shipwright-build-webhook-cert
  namespace: shipwright-build
spec:
  secretName: shipwright-build-webhook-cert
  issuerRef:
    name: selfsigned-issuer
"#;

    fn crd(name: &str) -> serde_json::Value {
        json!({"apiVersion": "apiextensions.k8s.io/v1", "kind": "CustomResourceDefinition", "metadata": {"name": name}})
    }

    #[tokio::test]
    async fn missing_cert_manager_is_an_error_without_retry_hint() {
        let c = MemoryCluster::new();
        let set = ManifestSet::from_yaml_str("certificates", CERTS).unwrap();
        let err = reconcile(&c, &KindRegistry::with_builtins(), &set, "ns1").await.unwrap_err();
        assert_eq!(err.to_string(), "cert-manager operator not installed");
        assert_eq!(err.retry(), crate::Retry::Backoff);
        assert!(c.objects_of_kind("Certificate").is_empty());
    }

    #[tokio::test]
    async fn certificate_targets_namespace_and_service_dns() {
        for prerequisite in [CERTIFICATES_CRD, CERT_MANAGER_OPERATOR_CRD] {
            let c = MemoryCluster::new();
            c.insert(crd(prerequisite));
            let set = ManifestSet::from_yaml_str("certificates", CERTS).unwrap();
            reconcile(&c, &KindRegistry::with_builtins(), &set, "ns1").await.unwrap();
            let cert = c
                .object(&ObjectRef::new("cert-manager.io/v1", "Certificate", Some("ns1"), "shipwright-build-webhook-cert"))
                .unwrap();
            assert_eq!(cert["spec"]["dnsNames"], json!(["shp-build-webhook.ns1.svc"]));
            assert!(c.contains(&ObjectRef::new("cert-manager.io/v1", "Issuer", Some("ns1"), "selfsigned-issuer")));
        }
    }
}
