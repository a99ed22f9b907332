//! Shipwright operator cluster access: the `ClusterClient` seam every reconcile step talks
//! through, object references, and the kind registry built at startup.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::core::GroupVersionKind;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as Json;

pub mod client;
pub mod object;
pub mod registry;

#[cfg(any(test, feature = "testing"))]
pub mod memory;

pub use client::KubeCluster;
pub use registry::KindRegistry;

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: String, name: String },
    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: String, name: String },
    #[error("conflict writing {kind} '{name}': {message}")]
    Conflict { kind: String, name: String, message: String },
    #[error("kind not served by the cluster: {0}")]
    UnknownKind(String),
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("kubernetes error: {0}")]
    Api(#[source] kube::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClusterError {
    /// Classify a kube error for the object it was about.
    pub fn from_kube(err: kube::Error, target: &ObjectRef) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => Self::NotFound { kind: target.kind.clone(), name: target.name.clone() },
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                Self::AlreadyExists { kind: target.kind.clone(), name: target.name.clone() }
            }
            kube::Error::Api(resp) if resp.code == 409 => {
                Self::Conflict { kind: target.kind.clone(), name: target.name.clone(), message: resp.message.clone() }
            }
            _ => Self::Api(err),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Identity of a single object: type plus optional namespace and name.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectRef {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self { api_version: api_version.into(), kind: kind.into(), namespace: namespace.map(str::to_string), name: name.into() }
    }

    /// Reference for a statically typed resource.
    pub fn of<K: Resource<DynamicType = ()>>(name: &str, namespace: Option<&str>) -> Self {
        Self::new(K::api_version(&()), K::kind(&()), namespace, name)
    }

    /// Reference read from an object's `apiVersion`, `kind` and `metadata`.
    pub fn from_object(obj: &Json) -> Result<Self, ClusterError> {
        let api_version = object::api_version(obj).ok_or_else(|| ClusterError::Invalid("object missing apiVersion".into()))?;
        let kind = object::kind(obj).ok_or_else(|| ClusterError::Invalid("object missing kind".into()))?;
        let name = object::name(obj).ok_or_else(|| ClusterError::Invalid(format!("{} missing metadata.name", kind)))?;
        Ok(Self::new(api_version, kind, object::namespace(obj), name))
    }

    pub fn gvk(&self) -> GroupVersionKind {
        let (group, version) = split_api_version(&self.api_version);
        GroupVersionKind::gvk(group, version, &self.kind)
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} {}/{}", self.api_version, self.kind, ns, self.name),
            None => write!(f, "{}/{} {}", self.api_version, self.kind, self.name),
        }
    }
}

/// List request: one type, optional namespace, equality label selector.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl ListQuery {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { api_version: api_version.into(), kind: kind.into(), ..Default::default() }
    }

    pub fn of<K: Resource<DynamicType = ()>>() -> Self {
        Self::new(K::api_version(&()), K::kind(&()))
    }

    pub fn in_namespace(mut self, ns: &str) -> Self {
        self.namespace = Some(ns.to_string());
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// `k1=v1,k2=v2`, empty when there are no labels.
    pub fn label_selector(&self) -> String {
        self.labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
    }

    pub fn matches(&self, obj: &Json) -> bool {
        if object::api_version(obj) != Some(self.api_version.as_str()) || object::kind(obj) != Some(self.kind.as_str()) {
            return false;
        }
        if let Some(ns) = &self.namespace {
            if object::namespace(obj) != Some(ns.as_str()) { return false; }
        }
        self.labels.iter().all(|(k, v)| object::label(obj, k) == Some(v.as_str()))
    }
}

/// Cluster API surface consumed by the reconcile steps. Objects travel as JSON documents
/// (`apiVersion`, `kind`, `metadata`, ...); typed callers convert with [`to_json`] / [`from_json`].
#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// `Ok(None)` when the object does not exist.
    async fn get(&self, target: &ObjectRef) -> Result<Option<Json>, ClusterError>;

    async fn list(&self, query: &ListQuery) -> Result<Vec<Json>, ClusterError>;

    /// Fails with `AlreadyExists` when the object is present.
    async fn create(&self, obj: &Json) -> Result<Json, ClusterError>;

    /// Server-side upsert: create when absent, otherwise converge to `obj`.
    async fn apply(&self, obj: &Json) -> Result<Json, ClusterError>;

    /// Full replace guarded by `metadata.resourceVersion`; a stale version yields `Conflict`.
    async fn update(&self, obj: &Json) -> Result<Json, ClusterError>;

    /// Replace the status subresource, guarded the same way as [`ClusterClient::update`].
    async fn update_status(&self, obj: &Json) -> Result<Json, ClusterError>;

    /// Fails with `NotFound` when the object is absent.
    async fn delete(&self, target: &ObjectRef) -> Result<(), ClusterError>;
}

pub fn to_json<T: Serialize>(obj: &T) -> Result<Json, ClusterError> {
    Ok(serde_json::to_value(obj)?)
}

pub fn from_json<T: DeserializeOwned>(v: Json) -> Result<T, ClusterError> {
    Ok(serde_json::from_value(v)?)
}

/// Typed get.
pub async fn get_as<T: DeserializeOwned>(client: &dyn ClusterClient, target: &ObjectRef) -> Result<Option<T>, ClusterError> {
    client.get(target).await?.map(from_json).transpose()
}

/// Split `group/version` (or a core `version`) into its parts.
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

    #[test]
    fn object_ref_for_typed_resources() {
        let crd = ObjectRef::of::<CustomResourceDefinition>("taskruns.tekton.dev", None);
        assert_eq!(crd.api_version, "apiextensions.k8s.io/v1");
        assert_eq!(crd.kind, "CustomResourceDefinition");
        assert_eq!(crd.gvk().group, "apiextensions.k8s.io");
        let pod = ObjectRef::of::<Pod>("p", Some("ns"));
        assert_eq!(pod.gvk().group, "");
        assert_eq!(pod.to_string(), "v1/Pod ns/p");
    }

    #[test]
    fn object_ref_from_object_reports_missing_fields() {
        let e = ObjectRef::from_object(&serde_json::json!({"kind": "ConfigMap", "metadata": {"name": "x"}})).unwrap_err();
        assert!(e.to_string().contains("missing apiVersion"), "e={}", e);
        let e = ObjectRef::from_object(&serde_json::json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {}})).unwrap_err();
        assert!(e.to_string().contains("missing metadata.name"), "e={}", e);
    }

    #[test]
    fn list_query_matches_type_namespace_and_labels() {
        let q = ListQuery::of::<Pod>().in_namespace("ns1").with_label("name", "shp-build-webhook");
        assert_eq!(q.label_selector(), "name=shp-build-webhook");
        let pod = serde_json::json!({
            "apiVersion": "v1", "kind": "Pod",
            "metadata": {"name": "w", "namespace": "ns1", "labels": {"name": "shp-build-webhook", "x": "y"}}
        });
        assert!(q.matches(&pod));
        let mut other_ns = pod.clone();
        other_ns["metadata"]["namespace"] = "ns2".into();
        assert!(!q.matches(&other_ns));
        let mut other_label = pod.clone();
        other_label["metadata"]["labels"]["name"] = "controller".into();
        assert!(!q.matches(&other_label));
    }

    #[test]
    fn split_api_version_handles_core_group() {
        assert_eq!(split_api_version("v1"), ("", "v1"));
        assert_eq!(split_api_version("apps/v1"), ("apps", "v1"));
    }
}
