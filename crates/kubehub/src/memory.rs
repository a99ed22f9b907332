//! In-memory `ClusterClient` for tests. Mirrors the API server behaviour the operator relies on:
//! resourceVersion conflicts, finalizer-aware deletion, status subresource separation and
//! label-selector listing.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::Value as Json;

use crate::object;
use crate::registry::KindRegistry;
use crate::{ClusterClient, ClusterError, ListQuery, ObjectRef};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    Get,
    List,
    Create,
    Apply,
    Update,
    UpdateStatus,
    Delete,
}

#[derive(Clone, Debug)]
struct Failure {
    verb: Verb,
    kind: String,
    message: String,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjectRef, Json>,
    revision: u64,
    failures: Vec<Failure>,
    writes: usize,
}

pub struct MemoryCluster {
    registry: Arc<KindRegistry>,
    state: Mutex<State>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::with_registry(Arc::new(KindRegistry::with_builtins()))
    }

    pub fn with_registry(registry: Arc<KindRegistry>) -> Self {
        Self { registry, state: Mutex::new(State::default()) }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Make every `verb` call on `kind` fail with `Rejected(message)` until cleared.
    pub fn fail(&self, verb: Verb, kind: &str, message: &str) {
        self.state().failures.push(Failure { verb, kind: kind.to_string(), message: message.to_string() });
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    /// Store an object as-is (plus server fields), bypassing create semantics.
    pub fn insert(&self, obj: Json) -> Json {
        let key = match self.key_of(&obj) {
            Ok(k) => k,
            Err(e) => panic!("insert: {}", e),
        };
        let mut st = self.state();
        let stored = stamp(&mut st, obj, &key);
        st.objects.insert(key, stored.clone());
        stored
    }

    pub fn object(&self, target: &ObjectRef) -> Option<Json> {
        let key = self.normalize(target.clone());
        self.state().objects.get(&key).cloned()
    }

    pub fn contains(&self, target: &ObjectRef) -> bool {
        self.object(target).is_some()
    }

    pub fn objects_of_kind(&self, kind: &str) -> Vec<Json> {
        self.state().objects.iter().filter(|(k, _)| k.kind == kind).map(|(_, v)| v.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.state().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of successful mutating calls so far.
    pub fn writes(&self) -> usize {
        self.state().writes
    }

    /// External delete request: sets the deletion timestamp, or removes when no finalizers remain.
    pub fn mark_for_deletion(&self, target: &ObjectRef) -> Result<(), ClusterError> {
        let key = self.normalize(target.clone());
        let mut st = self.state();
        delete_locked(&mut st, &key)
    }

    fn normalize(&self, mut key: ObjectRef) -> ObjectRef {
        if !self.registry.is_namespaced(&key.api_version, &key.kind) {
            key.namespace = None;
        }
        key
    }

    fn key_of(&self, obj: &Json) -> Result<ObjectRef, ClusterError> {
        Ok(self.normalize(ObjectRef::from_object(obj)?))
    }

    fn check(&self, st: &State, verb: Verb, kind: &str) -> Result<(), ClusterError> {
        match st.failures.iter().find(|f| f.verb == verb && f.kind == kind) {
            Some(f) => Err(ClusterError::Rejected(f.message.clone())),
            None => Ok(()),
        }
    }
}

fn next_revision(st: &mut State) -> String {
    st.revision += 1;
    st.revision.to_string()
}

fn not_found(key: &ObjectRef) -> ClusterError {
    ClusterError::NotFound { kind: key.kind.clone(), name: key.name.clone() }
}

fn conflict(key: &ObjectRef, message: &str) -> ClusterError {
    ClusterError::Conflict { kind: key.kind.clone(), name: key.name.clone(), message: message.to_string() }
}

/// Fill server-owned metadata on a new object.
fn stamp(st: &mut State, mut obj: Json, key: &ObjectRef) -> Json {
    let rv = next_revision(st);
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    if let Some(meta) = object::metadata_mut(&mut obj) {
        match &key.namespace {
            Some(ns) => meta.insert("namespace".into(), Json::String(ns.clone())),
            None => meta.remove("namespace"),
        };
        meta.entry("uid").or_insert_with(|| Json::String(format!("uid-{}", rv)));
        meta.entry("creationTimestamp").or_insert_with(|| Json::String(now));
        meta.insert("resourceVersion".into(), Json::String(rv));
    }
    obj
}

/// Carry fields a client write cannot change over from `live` onto `desired`.
fn carry_server_fields(desired: &mut Json, live: &Json, keep_status: bool) {
    let live_meta = live.get("metadata").cloned().unwrap_or(Json::Null);
    if let Some(meta) = object::metadata_mut(desired) {
        for key in ["uid", "creationTimestamp", "deletionTimestamp"] {
            match live_meta.get(key) {
                Some(v) => meta.insert(key.into(), v.clone()),
                None => meta.remove(key),
            };
        }
    }
    if keep_status {
        if let Some(root) = desired.as_object_mut() {
            match live.get("status") {
                Some(s) => root.insert("status".into(), s.clone()),
                None => root.remove("status"),
            };
        }
    }
}

fn check_revision(desired: &Json, live: &Json, key: &ObjectRef) -> Result<(), ClusterError> {
    match object::resource_version(desired) {
        Some(rv) if Some(rv) != object::resource_version(live) => {
            Err(conflict(key, "the object has been modified; please apply your changes to the latest version and try again"))
        }
        _ => Ok(()),
    }
}

fn delete_locked(st: &mut State, key: &ObjectRef) -> Result<(), ClusterError> {
    let live = st.objects.get(key).cloned().ok_or_else(|| not_found(key))?;
    if object::finalizers(&live).is_empty() {
        st.objects.remove(key);
    } else if !object::is_deleting(&live) {
        let rv = next_revision(st);
        let mut obj = live;
        if let Some(meta) = object::metadata_mut(&mut obj) {
            meta.insert("deletionTimestamp".into(), Json::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)));
            meta.insert("resourceVersion".into(), Json::String(rv));
        }
        st.objects.insert(key.clone(), obj);
    }
    st.writes += 1;
    Ok(())
}

#[async_trait]
impl ClusterClient for MemoryCluster {
    async fn get(&self, target: &ObjectRef) -> Result<Option<Json>, ClusterError> {
        let st = self.state();
        self.check(&st, Verb::Get, &target.kind)?;
        Ok(st.objects.get(&self.normalize(target.clone())).cloned())
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<Json>, ClusterError> {
        let st = self.state();
        self.check(&st, Verb::List, &query.kind)?;
        Ok(st.objects.values().filter(|o| query.matches(o)).cloned().collect())
    }

    async fn create(&self, obj: &Json) -> Result<Json, ClusterError> {
        let key = self.key_of(obj)?;
        let mut st = self.state();
        self.check(&st, Verb::Create, &key.kind)?;
        if st.objects.contains_key(&key) {
            return Err(ClusterError::AlreadyExists { kind: key.kind, name: key.name });
        }
        let mut fresh = obj.clone();
        if let Some(meta) = object::metadata_mut(&mut fresh) {
            meta.remove("resourceVersion");
        }
        let stored = stamp(&mut st, fresh, &key);
        st.objects.insert(key, stored.clone());
        st.writes += 1;
        Ok(stored)
    }

    async fn apply(&self, obj: &Json) -> Result<Json, ClusterError> {
        let key = self.key_of(obj)?;
        let mut st = self.state();
        self.check(&st, Verb::Apply, &key.kind)?;
        let mut desired = obj.clone();
        if let Some(live) = st.objects.get(&key).cloned() {
            carry_server_fields(&mut desired, &live, true);
            if object::finalizers(&desired).is_empty() {
                if let (Some(meta), Some(f)) = (object::metadata_mut(&mut desired), live.pointer("/metadata/finalizers")) {
                    meta.insert("finalizers".into(), f.clone());
                }
            }
        }
        let stored = stamp(&mut st, desired, &key);
        st.objects.insert(key, stored.clone());
        st.writes += 1;
        Ok(stored)
    }

    async fn update(&self, obj: &Json) -> Result<Json, ClusterError> {
        let key = self.key_of(obj)?;
        let mut st = self.state();
        self.check(&st, Verb::Update, &key.kind)?;
        let live = st.objects.get(&key).cloned().ok_or_else(|| not_found(&key))?;
        check_revision(obj, &live, &key)?;
        let mut desired = obj.clone();
        carry_server_fields(&mut desired, &live, true);
        st.writes += 1;
        if object::is_deleting(&desired) && object::finalizers(&desired).is_empty() {
            st.objects.remove(&key);
            return Ok(desired);
        }
        let stored = stamp(&mut st, desired, &key);
        st.objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn update_status(&self, obj: &Json) -> Result<Json, ClusterError> {
        let key = self.key_of(obj)?;
        let mut st = self.state();
        self.check(&st, Verb::UpdateStatus, &key.kind)?;
        let live = st.objects.get(&key).cloned().ok_or_else(|| not_found(&key))?;
        check_revision(obj, &live, &key)?;
        let mut stored = live;
        if let Some(root) = stored.as_object_mut() {
            match obj.get("status") {
                Some(s) => root.insert("status".into(), s.clone()),
                None => root.remove("status"),
            };
        }
        let stored = stamp(&mut st, stored, &key);
        st.objects.insert(key, stored.clone());
        st.writes += 1;
        Ok(stored)
    }

    async fn delete(&self, target: &ObjectRef) -> Result<(), ClusterError> {
        let key = self.normalize(target.clone());
        let mut st = self.state();
        self.check(&st, Verb::Delete, &key.kind)?;
        delete_locked(&mut st, &key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cm(ns: &str, name: &str) -> Json {
        json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name, "namespace": ns}, "data": {"k": "v"}})
    }

    #[tokio::test]
    async fn create_then_get_assigns_server_fields() {
        let c = MemoryCluster::new();
        let created = c.create(&cm("ns1", "a")).await.unwrap();
        assert!(object::resource_version(&created).is_some());
        let got = c.get(&ObjectRef::new("v1", "ConfigMap", Some("ns1"), "a")).await.unwrap().unwrap();
        assert_eq!(got, created);
        let again = c.create(&cm("ns1", "a")).await.unwrap_err();
        assert!(again.is_already_exists());
    }

    #[tokio::test]
    async fn cluster_scoped_objects_ignore_namespace() {
        let c = MemoryCluster::new();
        c.create(&json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "ns1", "namespace": "junk"}})).await.unwrap();
        let got = c.get(&ObjectRef::new("v1", "Namespace", None, "ns1")).await.unwrap().unwrap();
        assert_eq!(object::namespace(&got), None);
    }

    #[tokio::test]
    async fn stale_update_is_a_conflict() {
        let c = MemoryCluster::new();
        let v1 = c.create(&cm("ns1", "a")).await.unwrap();
        let mut first = v1.clone();
        first["data"]["k"] = "x".into();
        c.update(&first).await.unwrap();
        let mut stale = v1;
        stale["data"]["k"] = "y".into();
        assert!(c.update(&stale).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn delete_waits_for_finalizers() {
        let c = MemoryCluster::new();
        let mut obj = cm("ns1", "a");
        obj["metadata"]["finalizers"] = json!(["f"]);
        c.create(&obj).await.unwrap();
        let r = ObjectRef::new("v1", "ConfigMap", Some("ns1"), "a");
        c.delete(&r).await.unwrap();
        let live = c.object(&r).unwrap();
        assert!(object::is_deleting(&live));
        let mut cleared = live;
        cleared["metadata"]["finalizers"] = json!([]);
        c.update(&cleared).await.unwrap();
        assert!(!c.contains(&r));
        assert!(c.delete(&r).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn status_writes_leave_spec_alone_and_updates_keep_status() {
        let c = MemoryCluster::new();
        let live = c.create(&cm("ns1", "a")).await.unwrap();
        let mut st = live.clone();
        st["status"] = json!({"phase": "ok"});
        st["data"]["k"] = "ignored".into();
        let after = c.update_status(&st).await.unwrap();
        assert_eq!(after["data"]["k"], "v");
        assert_eq!(after["status"]["phase"], "ok");
        let mut spec = after.clone();
        spec.as_object_mut().unwrap().remove("status");
        let after = c.update(&spec).await.unwrap();
        assert_eq!(after["status"]["phase"], "ok");
    }

    #[tokio::test]
    async fn list_filters_by_labels_and_failures_are_injected() {
        let c = MemoryCluster::new();
        let mut a = cm("ns1", "a");
        a["metadata"]["labels"] = json!({"name": "hook"});
        c.create(&a).await.unwrap();
        c.create(&cm("ns1", "b")).await.unwrap();
        let q = ListQuery::new("v1", "ConfigMap").in_namespace("ns1").with_label("name", "hook");
        assert_eq!(c.list(&q).await.unwrap().len(), 1);
        c.fail(Verb::List, "ConfigMap", "boom");
        assert!(matches!(c.list(&q).await, Err(ClusterError::Rejected(m)) if m == "boom"));
        c.clear_failures();
        assert!(c.list(&q).await.is_ok());
    }
}
