#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;

use shp_apply::{AnnotationPolicy, ManifestSet, Pipeline, Transform};
use shp_kubehub::memory::{MemoryCluster, Verb};
use shp_kubehub::{object, KindRegistry, ObjectRef};

fn testdata(rel: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/testdata").join(rel)
}

fn release() -> ManifestSet {
    ManifestSet::load(&testdata("release.yaml")).unwrap()
}

fn pipeline(ns: &str) -> Pipeline {
    let registry = KindRegistry::with_builtins();
    Pipeline::new()
        .then(Transform::inject_namespace(ns, registry.cluster_scoped_kinds()))
        .then(Transform::replace_images(
            &BTreeMap::from([("GIT_CONTAINER_IMAGE".to_string(), "foo.bar/image/bash".to_string())]),
            Some("IMAGE_SHIPWRIGHT_"),
        ))
        .then(Transform::inject_annotation(
            "cert-manager.io/inject-ca-from",
            &format!("{}/shipwright-build-webhook-cert", ns),
            AnnotationPolicy::Overwrite,
            &["CustomResourceDefinition"],
        ))
        .then(Transform::truncate_field("description", 50, &["CustomResourceDefinition"]))
}

fn transformed(ns: &str) -> ManifestSet {
    release().without_kind("Namespace").transform(&pipeline(ns)).unwrap()
}

#[test]
fn directory_load_is_recursive_sorted_and_yaml_only() {
    let set = ManifestSet::load(&testdata("nested")).unwrap();
    let names: Vec<_> = set.objects().iter().filter_map(object::name).collect();
    assert_eq!(names, vec!["a", "b"]);
}

#[test]
fn missing_path_is_an_io_error() {
    let err = ManifestSet::load(&testdata("does-not-exist")).unwrap_err();
    assert!(err.to_string().contains("does-not-exist"), "err={}", err);
}

#[test]
fn oversized_payload_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let p = dir.path().join("big.yaml");
    let mut yaml = String::from("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: big\ndata:\n");
    for i in 0..100_000 {
        yaml.push_str(&format!("  k{}: v\n", i));
    }
    std::fs::write(&p, yaml).unwrap();
    let err = ManifestSet::load(&p).unwrap_err();
    assert!(err.to_string().contains("too large"), "err={}", err);
}

#[test]
fn release_pipeline_targets_namespace_and_clips_descriptions() {
    let set = transformed("ns1");
    assert_eq!(set.len(), 4);
    for o in set.objects() {
        match object::kind(o).unwrap() {
            "CustomResourceDefinition" => {
                assert!(object::namespace(o).is_none());
                assert_eq!(o["metadata"]["annotations"]["cert-manager.io/inject-ca-from"], "ns1/shipwright-build-webhook-cert");
                let d = o["spec"]["versions"][0]["schema"]["openAPIV3Schema"]["description"].as_str().unwrap();
                assert_eq!(d.chars().count(), 50);
                let nested = o["spec"]["versions"][0]["schema"]["openAPIV3Schema"]["properties"]["spec"]["description"].as_str().unwrap();
                assert_eq!(nested.chars().count(), 50);
            }
            "ClusterRoleBinding" => {
                assert!(object::namespace(o).is_none());
                assert_eq!(o["subjects"][0]["namespace"], "ns1");
            }
            "Deployment" => {
                assert_eq!(object::namespace(o), Some("ns1"));
                let env = &o["spec"]["template"]["spec"]["containers"][0]["env"];
                assert_eq!(env[0]["value"], "foo.bar/image/bash");
                assert_eq!(env[1]["value"], "ghcr.io/shipwright-io/build/bundle:v0.13.0");
            }
            _ => assert_eq!(object::namespace(o), Some("ns1")),
        }
    }
}

#[tokio::test]
async fn apply_is_idempotent() {
    let cluster = MemoryCluster::new();
    let set = transformed("ns1");
    let first = set.apply(&cluster).await.unwrap();
    assert_eq!(first.created, 4);
    let snapshot: Vec<_> = set.objects().iter().map(|o| cluster.object(&ObjectRef::from_object(o).unwrap()).unwrap()).collect();
    let writes = cluster.writes();

    let second = set.apply(&cluster).await.unwrap();
    assert_eq!(second.unchanged, 4);
    assert_eq!(cluster.writes(), writes);
    let after: Vec<_> = set.objects().iter().map(|o| cluster.object(&ObjectRef::from_object(o).unwrap()).unwrap()).collect();
    assert_eq!(snapshot, after);
}

#[tokio::test]
async fn apply_converges_drifted_objects() {
    let cluster = MemoryCluster::new();
    let set = transformed("ns1");
    set.apply(&cluster).await.unwrap();
    let dep = ObjectRef::new("apps/v1", "Deployment", Some("ns1"), "shipwright-build-controller");
    let mut live = cluster.object(&dep).unwrap();
    live["spec"]["replicas"] = 3.into();
    cluster.insert(live);

    let report = set.apply(&cluster).await.unwrap();
    assert_eq!(report.updated, 1);
    assert_eq!(cluster.object(&dep).unwrap()["spec"]["replicas"], 1);
}

#[tokio::test]
async fn delete_keeps_crds_and_tolerates_absence() {
    let cluster = MemoryCluster::new();
    let set = transformed("ns1");
    set.apply(&cluster).await.unwrap();
    let sa = ObjectRef::new("v1", "ServiceAccount", Some("ns1"), "shipwright-build-controller");
    cluster.mark_for_deletion(&sa).unwrap();

    let deleted = set.delete(&cluster, true).await.unwrap();
    assert_eq!(deleted, 2);
    assert_eq!(cluster.objects_of_kind("CustomResourceDefinition").len(), 1);
    assert!(cluster.objects_of_kind("Deployment").is_empty());
    assert!(cluster.objects_of_kind("ClusterRoleBinding").is_empty());
}

#[tokio::test]
async fn apply_failure_names_the_object() {
    let cluster = MemoryCluster::new();
    cluster.fail(Verb::Create, "Deployment", "admission denied");
    let err = transformed("ns1").apply(&cluster).await.unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("Deployment 'shipwright-build-controller'"), "msg={}", msg);
    assert!(msg.contains("admission denied"), "msg={}", msg);
}
