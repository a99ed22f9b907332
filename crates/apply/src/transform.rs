//! Object transforms applied to every manifest document before it reaches the cluster.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value as Json};

use shp_kubehub::object;

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("'{0}' is not a valid dns name")]
    InvalidDnsName(String),
    #[error("{kind} '{name}': {message}")]
    Malformed { kind: String, name: String, message: String },
}

/// What to do when the annotation is already present.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnnotationPolicy {
    Retain,
    Overwrite,
}

#[derive(Clone, Debug)]
pub enum Transform {
    /// Set `metadata.namespace` on namespaced kinds and point in-cluster service and
    /// subject references at `namespace`.
    InjectNamespace { namespace: String, cluster_scoped: Vec<String> },
    /// Container image / env value overrides on Deployments, keyed by normalized name.
    ReplaceImages { images: BTreeMap<String, String>, env_prefix: Option<String> },
    /// Empty `kinds` means every kind.
    InjectAnnotation { key: String, value: String, policy: AnnotationPolicy, kinds: Vec<String> },
    TruncateField { field: String, max: usize, kinds: Vec<String> },
    /// `spec.dnsNames` on Certificates.
    InjectDnsNames { names: Vec<String> },
}

impl Transform {
    pub fn inject_namespace(namespace: &str, cluster_scoped: Vec<String>) -> Self {
        Self::InjectNamespace { namespace: namespace.to_string(), cluster_scoped }
    }

    /// Keys and the names they are matched against are both normalized (lower-case, `-` to `_`).
    /// Env vars named `<env_prefix><KEY>` also match `KEY`.
    pub fn replace_images(images: &BTreeMap<String, String>, env_prefix: Option<&str>) -> Self {
        Self::ReplaceImages {
            images: images.iter().map(|(k, v)| (normalize_key(k), v.clone())).collect(),
            env_prefix: env_prefix.map(normalize_key),
        }
    }

    pub fn inject_annotation(key: &str, value: &str, policy: AnnotationPolicy, kinds: &[&str]) -> Self {
        Self::InjectAnnotation {
            key: key.to_string(),
            value: value.to_string(),
            policy,
            kinds: kinds.iter().map(|k| k.to_string()).collect(),
        }
    }

    pub fn truncate_field(field: &str, max: usize, kinds: &[&str]) -> Self {
        Self::TruncateField { field: field.to_string(), max, kinds: kinds.iter().map(|k| k.to_string()).collect() }
    }

    pub fn inject_dns_names(names: Vec<String>) -> Self {
        Self::InjectDnsNames { names }
    }

    pub fn apply(&self, mut obj: Json) -> Result<Json, TransformError> {
        let kind = object::kind(&obj).unwrap_or_default().to_string();
        match self {
            Self::InjectNamespace { namespace, cluster_scoped } => {
                if !cluster_scoped.iter().any(|k| k == &kind) {
                    object::set_namespace(&mut obj, namespace);
                }
                rewrite_references(&mut obj, &kind, namespace);
            }
            Self::ReplaceImages { images, env_prefix } => {
                if kind == "Deployment" {
                    replace_images(&mut obj, images, env_prefix.as_deref());
                }
            }
            Self::InjectAnnotation { key, value, policy, kinds } => {
                if kinds.is_empty() || kinds.contains(&kind) {
                    inject_annotation(&mut obj, &kind, key, value, *policy)?;
                }
            }
            Self::TruncateField { field, max, kinds } => {
                if kinds.is_empty() || kinds.contains(&kind) {
                    truncate_nested(&mut obj, field, *max);
                }
            }
            Self::InjectDnsNames { names } => {
                if kind == "Certificate" {
                    for n in names {
                        if !is_dns_name(n) {
                            return Err(TransformError::InvalidDnsName(n.clone()));
                        }
                    }
                    let err = malformed(&kind, &obj, "spec is not a map");
                    let spec = ensure_map(&mut obj, "spec").ok_or(err)?;
                    spec.insert("dnsNames".into(), Json::Array(names.iter().cloned().map(Json::String).collect()));
                }
            }
        }
        Ok(obj)
    }
}

/// Ordered list of transforms run over each object in turn.
#[derive(Clone, Debug, Default)]
pub struct Pipeline {
    steps: Vec<Transform>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, t: Transform) -> Self {
        self.steps.push(t);
        self
    }

    pub fn push(&mut self, t: Transform) {
        self.steps.push(t);
    }

    pub fn steps(&self) -> &[Transform] {
        &self.steps
    }

    pub fn apply(&self, obj: Json) -> Result<Json, TransformError> {
        self.steps.iter().try_fold(obj, |o, t| t.apply(o))
    }
}

pub fn normalize_key(s: &str) -> String {
    s.to_lowercase().replace('-', "_")
}

fn malformed(kind: &str, obj: &Json, message: &str) -> TransformError {
    TransformError::Malformed {
        kind: kind.to_string(),
        name: object::name(obj).unwrap_or_default().to_string(),
        message: message.to_string(),
    }
}

/// `obj[key]` as a map, inserted when missing. `None` when the field holds something else.
fn ensure_map<'a>(obj: &'a mut Json, key: &str) -> Option<&'a mut Map<String, Json>> {
    let root = obj.as_object_mut()?;
    root.entry(key).or_insert_with(|| Json::Object(Map::new())).as_object_mut()
}

fn rewrite_references(obj: &mut Json, kind: &str, namespace: &str) {
    let ns = Json::String(namespace.to_string());
    match kind {
        "ClusterRoleBinding" | "RoleBinding" => {
            if let Some(subjects) = obj.get_mut("subjects").and_then(Json::as_array_mut) {
                for s in subjects.iter_mut().filter(|s| s.get("kind").and_then(Json::as_str) == Some("ServiceAccount")) {
                    if let Some(m) = s.as_object_mut() {
                        m.insert("namespace".into(), ns.clone());
                    }
                }
            }
        }
        "ValidatingWebhookConfiguration" | "MutatingWebhookConfiguration" => {
            if let Some(hooks) = obj.get_mut("webhooks").and_then(Json::as_array_mut) {
                for h in hooks.iter_mut() {
                    if let Some(svc) = h.pointer_mut("/clientConfig/service").and_then(Json::as_object_mut) {
                        svc.insert("namespace".into(), ns.clone());
                    }
                }
            }
        }
        "CustomResourceDefinition" => {
            if let Some(svc) = obj.pointer_mut("/spec/conversion/webhook/clientConfig/service").and_then(Json::as_object_mut) {
                svc.insert("namespace".into(), ns);
            }
        }
        "APIService" => {
            if let Some(svc) = obj.pointer_mut("/spec/service").and_then(Json::as_object_mut) {
                svc.insert("namespace".into(), ns);
            }
        }
        _ => {}
    }
}

fn replace_images(obj: &mut Json, images: &BTreeMap<String, String>, env_prefix: Option<&str>) {
    let Some(containers) = obj.pointer_mut("/spec/template/spec/containers").and_then(Json::as_array_mut) else {
        return;
    };
    for c in containers.iter_mut() {
        let name = c.get("name").and_then(Json::as_str).map(normalize_key);
        if let Some(url) = name.and_then(|n| images.get(&n)) {
            c["image"] = Json::String(url.clone());
        }
        let Some(env) = c.get_mut("env").and_then(Json::as_array_mut) else { continue };
        for e in env.iter_mut() {
            let Some(key) = e.get("name").and_then(Json::as_str).map(normalize_key) else { continue };
            let hit = images
                .get(&key)
                .or_else(|| env_prefix.and_then(|p| key.strip_prefix(p)).and_then(|k| images.get(k)));
            if let Some(url) = hit {
                e["value"] = Json::String(url.clone());
            }
        }
    }
}

fn inject_annotation(obj: &mut Json, kind: &str, key: &str, value: &str, policy: AnnotationPolicy) -> Result<(), TransformError> {
    let name = object::name(obj).unwrap_or_default().to_string();
    let meta = object::metadata_mut(obj).ok_or_else(|| TransformError::Malformed {
        kind: kind.to_string(),
        name: name.clone(),
        message: "object is not a map".into(),
    })?;
    let annotations = meta
        .entry("annotations")
        .or_insert_with(|| Json::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| TransformError::Malformed { kind: kind.to_string(), name, message: "annotations is not a map".into() })?;
    if policy == AnnotationPolicy::Retain && annotations.contains_key(key) {
        return Ok(());
    }
    annotations.insert(key.to_string(), Json::String(value.to_string()));
    Ok(())
}

/// Clip every string stored under `field`, at any depth, to `max` characters.
pub fn truncate_nested(v: &mut Json, field: &str, max: usize) {
    match v {
        Json::Object(map) => {
            for (k, child) in map.iter_mut() {
                match child {
                    Json::String(s) if k == field => {
                        if s.chars().count() > max {
                            *s = s.chars().take(max).collect();
                        }
                    }
                    other => truncate_nested(other, field, max),
                }
            }
        }
        Json::Array(items) => items.iter_mut().for_each(|i| truncate_nested(i, field, max)),
        _ => {}
    }
}

pub fn is_dns_name(s: &str) -> bool {
    static DNS: OnceLock<Option<Regex>> = OnceLock::new();
    let re = DNS.get_or_init(|| {
        Regex::new(r"^([a-zA-Z0-9_][a-zA-Z0-9_-]{0,62})(\.[a-zA-Z0-9_][a-zA-Z0-9_-]{0,62})*[._]?$").ok()
    });
    if s.is_empty() || s.replace('.', "").len() > 255 || s.parse::<std::net::IpAddr>().is_ok() {
        return false;
    }
    re.as_ref().map(|r| r.is_match(s)).unwrap_or(false)
}
