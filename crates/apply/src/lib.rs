//! Shipwright operator manifests: YAML loading, the transform pipeline, idempotent apply and
//! filtered delete against a `ClusterClient`.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use metrics::counter;
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::{debug, info};

use shp_kubehub::{object, ClusterClient, ClusterError, ObjectRef};

pub mod transform;

pub use transform::{AnnotationPolicy, Pipeline, Transform, TransformError};

pub const CRD_KIND: &str = "CustomResourceDefinition";

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("reading {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("parsing {source_name}: {source}")]
    Yaml { source_name: String, source: serde_yaml::Error },
    #[error("{source_name}: {message}")]
    Invalid { source_name: String, message: String },
    #[error("{source_name}: {message}")]
    TooLarge { source_name: String, message: String },
    #[error("transforming {target}: {source}")]
    Transform { target: String, source: TransformError },
    #[error("{action} {target}: {source}")]
    Cluster { action: &'static str, target: String, source: ClusterError },
}

/// Size guards applied to every manifest file; overridable through `SHP_MAX_YAML_BYTES` and
/// `SHP_MAX_YAML_NODES`.
#[derive(Clone, Copy, Debug)]
struct YamlLimits {
    bytes: usize,
    nodes: usize,
}

impl YamlLimits {
    fn from_env() -> Self {
        let read = |var: &str, default: usize| std::env::var(var).ok().and_then(|s| s.parse().ok()).unwrap_or(default);
        Self { bytes: read("SHP_MAX_YAML_BYTES", 1_000_000), nodes: read("SHP_MAX_YAML_NODES", 100_000) }
    }
}

/// True once `v` holds `max` values or more, containers included.
fn exceeds_nodes(v: &Json, max: usize) -> bool {
    let mut pending = vec![v];
    let mut seen = 0usize;
    while let Some(cur) = pending.pop() {
        seen += 1;
        if seen >= max {
            return true;
        }
        match cur {
            Json::Object(map) => pending.extend(map.values()),
            Json::Array(items) => pending.extend(items.iter()),
            _ => {}
        }
    }
    false
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

/// Outcome counts of one [`ManifestSet::apply`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
}

/// Named, ordered collection of object documents.
#[derive(Debug, Clone, Default)]
pub struct ManifestSet {
    name: String,
    objects: Vec<Json>,
}

impl ManifestSet {
    pub fn new(name: impl Into<String>, objects: Vec<Json>) -> Self {
        Self { name: name.into(), objects }
    }

    /// Parse a multi-document YAML stream. Empty documents are skipped.
    pub fn from_yaml_str(name: &str, yaml: &str) -> Result<Self, ManifestError> {
        let mut objects = Vec::new();
        parse_documents(name, yaml, &mut objects)?;
        Ok(Self::new(name, objects))
    }

    /// Load a file, or every `.yaml`/`.yml` file below a directory in path order.
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let mut files = Vec::new();
        collect_files(path, &mut files)?;
        files.sort();
        let mut objects = Vec::new();
        for f in &files {
            let yaml = std::fs::read_to_string(f).map_err(|source| ManifestError::Io { path: f.clone(), source })?;
            parse_documents(&f.display().to_string(), &yaml, &mut objects)?;
        }
        debug!(path = %path.display(), files = files.len(), objects = objects.len(), "manifest loaded");
        Ok(Self::new(path.display().to_string(), objects))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn objects(&self) -> &[Json] {
        &self.objects
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn filter<F: Fn(&Json) -> bool>(&self, keep: F) -> Self {
        Self::new(self.name.clone(), self.objects.iter().filter(|o| keep(o)).cloned().collect())
    }

    pub fn without_kind(&self, kind: &str) -> Self {
        self.filter(|o| object::kind(o) != Some(kind))
    }

    pub fn transform(&self, pipeline: &Pipeline) -> Result<Self, ManifestError> {
        let objects = self
            .objects
            .iter()
            .map(|o| pipeline.apply(o.clone()).map_err(|source| ManifestError::Transform { target: describe(o), source }))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(self.name.clone(), objects))
    }

    /// Create absent objects, converge drifted ones, leave matching ones untouched.
    pub async fn apply(&self, client: &dyn ClusterClient) -> Result<ApplyReport, ManifestError> {
        let mut report = ApplyReport::default();
        for desired in &self.objects {
            let target = ObjectRef::from_object(desired).map_err(|source| cluster_err("apply", desired, source))?;
            let live = client.get(&target).await.map_err(|source| cluster_err("reading", desired, source))?;
            let res = match live {
                None => match client.create(desired).await {
                    Ok(_) => { report.created += 1; Ok(()) }
                    // created concurrently; converge instead
                    Err(e) if e.is_already_exists() => client.apply(desired).await.map(|_| report.updated += 1),
                    Err(e) => Err(e),
                },
                Some(live) => {
                    let s = diff_summary(&strip_noisy(desired.clone()), &strip_noisy(live));
                    if s.adds == 0 && s.updates == 0 {
                        report.unchanged += 1;
                        counter!("manifest_apply_skipped", 1u64);
                        continue;
                    }
                    client.apply(desired).await.map(|_| report.updated += 1)
                }
            };
            match res {
                Ok(()) => {
                    counter!("manifest_apply_ok", 1u64);
                    debug!(object = %target, "applied");
                }
                Err(source) => {
                    counter!("manifest_apply_err", 1u64);
                    return Err(cluster_err("applying", desired, source));
                }
            }
        }
        info!(manifest = %self.name, created = report.created, updated = report.updated, unchanged = report.unchanged, "manifest applied");
        Ok(report)
    }

    /// Delete every object, optionally keeping CustomResourceDefinitions. Absent objects are skipped.
    pub async fn delete(&self, client: &dyn ClusterClient, keep_crds: bool) -> Result<usize, ManifestError> {
        let mut deleted = 0usize;
        for obj in self.objects.iter().rev() {
            if keep_crds && object::kind(obj) == Some(CRD_KIND) {
                continue;
            }
            let target = ObjectRef::from_object(obj).map_err(|source| cluster_err("delete", obj, source))?;
            match client.delete(&target).await {
                Ok(()) => {
                    deleted += 1;
                    counter!("manifest_delete_ok", 1u64);
                    debug!(object = %target, "deleted");
                }
                Err(ClusterError::NotFound { .. }) | Err(ClusterError::UnknownKind(_)) => {}
                Err(source) => return Err(cluster_err("deleting", obj, source)),
            }
        }
        info!(manifest = %self.name, deleted, "manifest deleted");
        Ok(deleted)
    }
}

fn describe(obj: &Json) -> String {
    format!("{} '{}'", object::kind(obj).unwrap_or("<unknown>"), object::name(obj).unwrap_or("<unnamed>"))
}

fn cluster_err(action: &'static str, obj: &Json, source: ClusterError) -> ManifestError {
    ManifestError::Cluster { action, target: describe(obj), source }
}

fn collect_files(path: &Path, out: &mut Vec<PathBuf>) -> Result<(), ManifestError> {
    let io = |source| ManifestError::Io { path: path.to_path_buf(), source };
    if !path.is_dir() {
        if !path.exists() {
            return Err(io(std::io::Error::new(std::io::ErrorKind::NotFound, "no such file or directory")));
        }
        out.push(path.to_path_buf());
        return Ok(());
    }
    for entry in std::fs::read_dir(path).map_err(io)? {
        let p = entry.map_err(io)?.path();
        if p.is_dir() {
            collect_files(&p, out)?;
        } else if matches!(p.extension().and_then(|e| e.to_str()), Some("yaml") | Some("yml")) {
            out.push(p);
        }
    }
    Ok(())
}

fn parse_documents(source_name: &str, yaml: &str, out: &mut Vec<Json>) -> Result<(), ManifestError> {
    let invalid = |message: String| ManifestError::Invalid { source_name: source_name.to_string(), message };
    let too_large = |message: String| ManifestError::TooLarge { source_name: source_name.to_string(), message };
    let limits = YamlLimits::from_env();
    if yaml.len() > limits.bytes {
        return Err(too_large(format!("payload too large: {} bytes exceeds the {} byte limit", yaml.len(), limits.bytes)));
    }
    for doc in serde_yaml::Deserializer::from_str(yaml) {
        let val = serde_yaml::Value::deserialize(doc)
            .map_err(|source| ManifestError::Yaml { source_name: source_name.to_string(), source })?;
        if val.is_null() {
            continue;
        }
        let json = serde_json::to_value(val).map_err(|e| invalid(format!("converting YAML to JSON: {}", e)))?;
        if exceeds_nodes(&json, limits.nodes) {
            return Err(too_large(format!("document too large: more than {} values", limits.nodes)));
        }
        if object::api_version(&json).is_none() {
            return Err(invalid("YAML missing apiVersion".into()));
        }
        if object::kind(&json).is_none() {
            return Err(invalid("YAML missing kind".into()));
        }
        if object::name(&json).is_none() {
            return Err(invalid("YAML missing metadata.name".into()));
        }
        out.push(json);
    }
    Ok(())
}

fn strip_noisy(mut v: Json) -> Json {
    object::strip_server_fields(&mut v);
    v
}

/// Count the fields of `target` that are absent from or differ in `base`, plus fields of
/// `base` that `target` does not mention.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, adds: &mut usize, ups: &mut usize, rems: &mut usize) {
        use serde_json::Value as V;
        match (a, b) {
            (V::Object(ao), V::Object(bo)) => {
                for (k, av) in ao.iter() {
                    if let Some(bv) = bo.get(k) {
                        if av == bv { continue; }
                        walk(av, bv, adds, ups, rems);
                    } else {
                        *adds += 1;
                    }
                }
                for (k, _bv) in bo.iter() {
                    if !ao.contains_key(k) { *rems += 1; }
                }
            }
            (V::Array(aa), V::Array(bb)) => {
                let min_len = aa.len().min(bb.len());
                for i in 0..min_len {
                    if aa[i] != bb[i] { walk(&aa[i], &bb[i], adds, ups, rems); }
                }
                if aa.len() > bb.len() { *adds += aa.len() - bb.len(); }
                if bb.len() > aa.len() { *rems += bb.len() - aa.len(); }
            }
            // Scalars differ or type differs
            (av, bv) => { if av != bv { *ups += 1; } }
        }
    }
    let mut adds = 0usize; let mut ups = 0usize; let mut rems = 0usize;
    walk(target, base, &mut adds, &mut ups, &mut rems);
    DiffSummary { adds, updates: ups, removes: rems }
}
