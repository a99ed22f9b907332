//! Shipwright operator reconciliation: drives a cluster toward the installation a
//! `ShipwrightBuild` declares and reports progress on its Ready condition.

#![forbid(unsafe_code)]

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::core::GroupVersionKind;
use serde_json::Value as Json;

use shp_core::ShipwrightBuild;
use shp_kubehub::{ClusterClient, ClusterError, KindRegistry, ObjectRef};

pub mod buildstrategy;
pub mod certmanager;
pub mod engine;
pub mod error;
pub mod finalizer;
pub mod manifests;
pub mod status;
pub mod tekton;

pub use engine::Engine;
pub use error::{ControllerError, Retry};
pub use manifests::Manifests;
pub use tekton::DependencyState;

pub type Outcome = shp_core::ReconcileOutcome<ControllerError>;

/// Register the third-party kinds the operator reads or writes so they resolve without discovery.
pub fn register_kinds(registry: &KindRegistry) {
    registry.register::<ShipwrightBuild>(false);
    registry.register_gvk(&GroupVersionKind::gvk("operator.tekton.dev", "v1alpha1", "TektonConfig"), "tektonconfigs", false);
    registry.register_gvk(&GroupVersionKind::gvk("cert-manager.io", "v1", "Certificate"), "certificates", true);
    registry.register_gvk(&GroupVersionKind::gvk("cert-manager.io", "v1", "Issuer"), "issuers", true);
    registry.register_gvk(&GroupVersionKind::gvk("shipwright.io", "v1beta1", "ClusterBuildStrategy"), "clusterbuildstrategies", false);
}

/// Fetch a CustomResourceDefinition by name.
pub async fn get_crd(client: &dyn ClusterClient, name: &str) -> Result<Option<Json>, ClusterError> {
    client.get(&ObjectRef::of::<CustomResourceDefinition>(name, None)).await
}

pub async fn crd_exists(client: &dyn ClusterClient, name: &str) -> Result<bool, ClusterError> {
    Ok(get_crd(client, name).await?.is_some())
}
