//! Accessors over JSON-encoded cluster objects.

use serde_json::{Map, Value as Json};

pub fn api_version(obj: &Json) -> Option<&str> {
    obj.get("apiVersion").and_then(Json::as_str)
}

pub fn kind(obj: &Json) -> Option<&str> {
    obj.get("kind").and_then(Json::as_str)
}

pub fn name(obj: &Json) -> Option<&str> {
    obj.pointer("/metadata/name").and_then(Json::as_str)
}

pub fn namespace(obj: &Json) -> Option<&str> {
    obj.pointer("/metadata/namespace").and_then(Json::as_str).filter(|s| !s.is_empty())
}

pub fn resource_version(obj: &Json) -> Option<&str> {
    obj.pointer("/metadata/resourceVersion").and_then(Json::as_str)
}

pub fn label<'a>(obj: &'a Json, key: &str) -> Option<&'a str> {
    obj.pointer("/metadata/labels").and_then(|l| l.get(key)).and_then(Json::as_str)
}

pub fn finalizers(obj: &Json) -> Vec<String> {
    obj.pointer("/metadata/finalizers")
        .and_then(Json::as_array)
        .map(|a| a.iter().filter_map(|f| f.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

pub fn is_deleting(obj: &Json) -> bool {
    obj.pointer("/metadata/deletionTimestamp").map(|v| !v.is_null()).unwrap_or(false)
}

/// `metadata` as a mutable map, created when missing. `None` when `obj` is not a map.
pub fn metadata_mut(obj: &mut Json) -> Option<&mut Map<String, Json>> {
    let root = obj.as_object_mut()?;
    let meta = root.entry("metadata").or_insert_with(|| Json::Object(Map::new()));
    if !meta.is_object() {
        *meta = Json::Object(Map::new());
    }
    meta.as_object_mut()
}

pub fn set_namespace(obj: &mut Json, ns: &str) {
    if let Some(meta) = metadata_mut(obj) {
        meta.insert("namespace".into(), Json::String(ns.to_string()));
    }
}

/// Drop bookkeeping the API server owns so two renditions of an object can be compared.
pub fn strip_server_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        for key in ["managedFields", "resourceVersion", "uid", "generation", "creationTimestamp", "selfLink"] {
            meta.remove(key);
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
}

pub fn strip_managed_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        meta.remove("managedFields");
    }
}
