//! `ClusterClient` backed by a live API server through kube-rs dynamic objects.

use std::sync::Arc;

use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject},
    discovery::{self, Scope},
    Client,
};
use serde_json::Value as Json;
use tracing::debug;

use crate::object::{self, strip_managed_fields};
use crate::registry::KindRegistry;
use crate::{ClusterClient, ClusterError, ListQuery, ObjectRef};

pub const FIELD_MANAGER: &str = "shipwright-operator";

#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    registry: Arc<KindRegistry>,
}

impl KubeCluster {
    pub fn new(client: Client, registry: Arc<KindRegistry>) -> Self {
        Self { client, registry }
    }

    /// Resolve a kind through the registry, falling back to discovery; discovered kinds are cached.
    async fn resource_for(&self, target: &ObjectRef) -> Result<(ApiResource, bool), ClusterError> {
        if let Some(info) = self.registry.lookup(&target.api_version, &target.kind) {
            return Ok((info.resource, info.namespaced));
        }
        let gvk = target.gvk();
        let (ar, caps) = discovery::pinned_kind(&self.client, &gvk).await.map_err(|e| match e {
            kube::Error::Api(resp) if resp.code == 404 => ClusterError::UnknownKind(format!("{}/{}", target.api_version, target.kind)),
            other => ClusterError::Api(other),
        })?;
        let namespaced = matches!(caps.scope, Scope::Namespaced);
        debug!(api_version = %target.api_version, kind = %target.kind, namespaced, "kind discovered");
        self.registry.insert(ar.clone(), namespaced);
        Ok((ar, namespaced))
    }

    async fn api_for(&self, target: &ObjectRef) -> Result<Api<DynamicObject>, ClusterError> {
        let (ar, namespaced) = self.resource_for(target).await?;
        Ok(match (namespaced, target.namespace.as_deref()) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        })
    }
}

fn to_dynamic(obj: &Json) -> Result<DynamicObject, ClusterError> {
    Ok(serde_json::from_value(obj.clone())?)
}

fn to_value(obj: DynamicObject) -> Result<Json, ClusterError> {
    let mut v = serde_json::to_value(obj)?;
    strip_managed_fields(&mut v);
    Ok(v)
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get(&self, target: &ObjectRef) -> Result<Option<Json>, ClusterError> {
        let api = match self.api_for(target).await {
            Ok(api) => api,
            Err(ClusterError::UnknownKind(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        match api.get_opt(&target.name).await.map_err(|e| ClusterError::from_kube(e, target))? {
            Some(obj) => Ok(Some(to_value(obj)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<Json>, ClusterError> {
        let target = ObjectRef::new(&query.api_version, &query.kind, query.namespace.as_deref(), "");
        let api = self.api_for(&target).await?;
        let mut lp = ListParams::default();
        let selector = query.label_selector();
        if !selector.is_empty() {
            lp = lp.labels(&selector);
        }
        let list = api.list(&lp).await.map_err(|e| ClusterError::from_kube(e, &target))?;
        list.items.into_iter().map(to_value).collect()
    }

    async fn create(&self, obj: &Json) -> Result<Json, ClusterError> {
        let target = ObjectRef::from_object(obj)?;
        let api = self.api_for(&target).await?;
        let created = api.create(&PostParams::default(), &to_dynamic(obj)?).await.map_err(|e| ClusterError::from_kube(e, &target))?;
        to_value(created)
    }

    async fn apply(&self, obj: &Json) -> Result<Json, ClusterError> {
        let target = ObjectRef::from_object(obj)?;
        let api = self.api_for(&target).await?;
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        let applied = api.patch(&target.name, &pp, &Patch::Apply(obj)).await.map_err(|e| ClusterError::from_kube(e, &target))?;
        to_value(applied)
    }

    async fn update(&self, obj: &Json) -> Result<Json, ClusterError> {
        let target = ObjectRef::from_object(obj)?;
        let api = self.api_for(&target).await?;
        let replaced = api
            .replace(&target.name, &PostParams::default(), &to_dynamic(obj)?)
            .await
            .map_err(|e| ClusterError::from_kube(e, &target))?;
        to_value(replaced)
    }

    async fn update_status(&self, obj: &Json) -> Result<Json, ClusterError> {
        let target = ObjectRef::from_object(obj)?;
        let api = self.api_for(&target).await?;
        // resourceVersion in the patch body makes the server reject stale writes with 409
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": object::resource_version(obj) },
            "status": obj.get("status").cloned().unwrap_or(Json::Null),
        });
        let patched = api
            .patch_status(&target.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| ClusterError::from_kube(e, &target))?;
        to_value(patched)
    }

    async fn delete(&self, target: &ObjectRef) -> Result<(), ClusterError> {
        let api = self.api_for(target).await?;
        api.delete(&target.name, &DeleteParams::background()).await.map_err(|e| ClusterError::from_kube(e, target))?;
        Ok(())
    }
}
