//! Kind registry: maps `(apiVersion, kind)` to the API resource used to address it and
//! whether it is namespaced. Built once at startup and shared by reference.

use std::collections::HashMap;
use std::sync::RwLock;

use k8s_openapi::api::admissionregistration::v1::{MutatingWebhookConfiguration, ValidatingWebhookConfiguration};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    ConfigMap, Namespace, PersistentVolume, Pod, Secret, Service, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::api::scheduling::v1::PriorityClass;
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIService;
use kube::core::{ApiResource, GroupVersionKind};
use kube::Resource;

/// Kinds addressed without a namespace even when no registration says so.
pub const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "ValidatingWebhookConfiguration",
    "MutatingWebhookConfiguration",
    "APIService",
    "ClusterBuildStrategy",
    "PriorityClass",
    "StorageClass",
    "PersistentVolume",
];

#[derive(Clone, Debug)]
pub struct KindInfo {
    pub resource: ApiResource,
    pub namespaced: bool,
}

type Key = (String, String);

#[derive(Debug, Default)]
pub struct KindRegistry {
    kinds: RwLock<HashMap<Key, KindInfo>>,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in kinds the operator manifests use.
    pub fn with_builtins() -> Self {
        let r = Self::new();
        r.register::<Namespace>(false);
        r.register::<ConfigMap>(true);
        r.register::<Secret>(true);
        r.register::<Service>(true);
        r.register::<ServiceAccount>(true);
        r.register::<Pod>(true);
        r.register::<PersistentVolume>(false);
        r.register::<Deployment>(true);
        r.register::<Role>(true);
        r.register::<RoleBinding>(true);
        r.register::<ClusterRole>(false);
        r.register::<ClusterRoleBinding>(false);
        r.register::<CustomResourceDefinition>(false);
        r.register::<ValidatingWebhookConfiguration>(false);
        r.register::<MutatingWebhookConfiguration>(false);
        r.register::<APIService>(false);
        r.register::<PriorityClass>(false);
        r.register::<StorageClass>(false);
        r
    }

    pub fn register<K: Resource<DynamicType = ()>>(&self, namespaced: bool) {
        let ar = ApiResource::erase::<K>(&());
        self.insert(ar, namespaced);
    }

    /// Register a kind that has no Rust type (third-party CRDs).
    pub fn register_gvk(&self, gvk: &GroupVersionKind, plural: &str, namespaced: bool) {
        self.insert(ApiResource::from_gvk_with_plural(gvk, plural), namespaced);
    }

    pub fn insert(&self, resource: ApiResource, namespaced: bool) {
        let key = (resource.api_version.clone(), resource.kind.clone());
        if let Ok(mut kinds) = self.kinds.write() {
            kinds.insert(key, KindInfo { resource, namespaced });
        }
    }

    pub fn lookup(&self, api_version: &str, kind: &str) -> Option<KindInfo> {
        let kinds = self.kinds.read().ok()?;
        kinds.get(&(api_version.to_string(), kind.to_string())).cloned()
    }

    /// Whether objects of `kind` carry a namespace. Unknown kinds count as namespaced unless
    /// listed in [`CLUSTER_SCOPED_KINDS`].
    pub fn is_namespaced(&self, api_version: &str, kind: &str) -> bool {
        match self.lookup(api_version, kind) {
            Some(info) => info.namespaced,
            None => !CLUSTER_SCOPED_KINDS.contains(&kind),
        }
    }

    /// Kind names that never receive a namespace: the static list plus cluster-scoped registrations.
    pub fn cluster_scoped_kinds(&self) -> Vec<String> {
        let mut out: Vec<String> = CLUSTER_SCOPED_KINDS.iter().map(|k| k.to_string()).collect();
        if let Ok(kinds) = self.kinds.read() {
            for info in kinds.values().filter(|i| !i.namespaced) {
                if !out.contains(&info.resource.kind) {
                    out.push(info.resource.kind.clone());
                }
            }
        }
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_know_their_scope() {
        let r = KindRegistry::with_builtins();
        assert!(r.is_namespaced("apps/v1", "Deployment"));
        assert!(!r.is_namespaced("apiextensions.k8s.io/v1", "CustomResourceDefinition"));
        let dep = r.lookup("apps/v1", "Deployment").unwrap();
        assert_eq!(dep.resource.plural, "deployments");
    }

    #[test]
    fn unknown_kinds_fall_back_to_the_static_list() {
        let r = KindRegistry::new();
        assert!(!r.is_namespaced("shipwright.io/v1beta1", "ClusterBuildStrategy"));
        assert!(r.is_namespaced("shipwright.io/v1beta1", "BuildStrategy"));
    }

    #[test]
    fn registered_cluster_kinds_extend_the_list() {
        let r = KindRegistry::new();
        r.register_gvk(&GroupVersionKind::gvk("operator.tekton.dev", "v1alpha1", "TektonConfig"), "tektonconfigs", false);
        let kinds = r.cluster_scoped_kinds();
        assert!(kinds.contains(&"TektonConfig".to_string()));
        assert!(kinds.contains(&"Namespace".to_string()));
    }
}
