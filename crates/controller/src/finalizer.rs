//! Finalizer on the ShipwrightBuild guarding teardown of the installed manifest.

use tracing::debug;

use shp_core::{ShipwrightBuild, FINALIZER};
use shp_kubehub::{from_json, to_json, ClusterClient, ClusterError};

/// Append the finalizer and persist right away. No write when it is already present.
pub async fn set_finalizer(client: &dyn ClusterClient, build: &ShipwrightBuild) -> Result<ShipwrightBuild, ClusterError> {
    if build.has_finalizer() {
        return Ok(build.clone());
    }
    let mut b = build.clone();
    b.metadata.finalizers.get_or_insert_with(Vec::new).push(FINALIZER.to_string());
    let updated = from_json(client.update(&to_json(&b)?).await?)?;
    debug!(finalizer = FINALIZER, "finalizer set");
    Ok(updated)
}

/// Remove every occurrence of the finalizer and persist right away.
pub async fn unset_finalizer(client: &dyn ClusterClient, build: &ShipwrightBuild) -> Result<ShipwrightBuild, ClusterError> {
    let mut b = build.clone();
    let kept: Vec<String> = b.finalizers().iter().filter(|f| f.as_str() != FINALIZER).cloned().collect();
    b.metadata.finalizers = Some(kept);
    let updated = from_json(client.update(&to_json(&b)?).await?)?;
    debug!(finalizer = FINALIZER, "finalizer removed");
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shp_core::ShipwrightBuildSpec;
    use shp_kubehub::memory::MemoryCluster;
    use shp_kubehub::ObjectRef;

    async fn stored(c: &MemoryCluster, finalizers: &[&str]) -> ShipwrightBuild {
        let mut b = ShipwrightBuild::new("shipwright", ShipwrightBuildSpec { target_namespace: "ns1".into() });
        if !finalizers.is_empty() {
            b.metadata.finalizers = Some(finalizers.iter().map(|f| f.to_string()).collect());
        }
        from_json(c.create(&to_json(&b).unwrap()).await.unwrap()).unwrap()
    }

    #[tokio::test]
    async fn set_is_idempotent() {
        let c = MemoryCluster::new();
        let b = stored(&c, &["other"]).await;
        let b = set_finalizer(&c, &b).await.unwrap();
        let writes = c.writes();
        let b = set_finalizer(&c, &b).await.unwrap();
        assert_eq!(c.writes(), writes);
        assert_eq!(b.finalizers(), ["other".to_string(), FINALIZER.to_string()]);
    }

    #[tokio::test]
    async fn set_then_unset_restores_the_list() {
        let c = MemoryCluster::new();
        let b = stored(&c, &["a", "b"]).await;
        let before = b.finalizers().to_vec();
        let b = set_finalizer(&c, &b).await.unwrap();
        let b = unset_finalizer(&c, &b).await.unwrap();
        assert_eq!(b.finalizers(), before.as_slice());
    }

    #[tokio::test]
    async fn unset_removes_every_occurrence() {
        let c = MemoryCluster::new();
        let b = stored(&c, &[FINALIZER, "keep", FINALIZER]).await;
        let b = unset_finalizer(&c, &b).await.unwrap();
        assert_eq!(b.finalizers(), ["keep".to_string()]);
        let live = c.object(&ObjectRef::of::<ShipwrightBuild>("shipwright", None)).unwrap();
        assert_eq!(live["metadata"]["finalizers"], serde_json::json!(["keep"]));
    }

    #[tokio::test]
    async fn stale_object_is_a_conflict() {
        let c = MemoryCluster::new();
        let b = stored(&c, &[]).await;
        set_finalizer(&c, &b).await.unwrap();
        let mut stale = b.clone();
        stale.metadata.finalizers = Some(vec!["x".into()]);
        let err = unset_finalizer(&c, &stale).await.unwrap_err();
        assert!(err.is_conflict());
    }
}
