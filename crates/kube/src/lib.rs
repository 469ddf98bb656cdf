//! Kubernetes collaborator: dynamic GET/APPLY/DELETE and status patching.
//!
//! The reconciliation core reaches the cluster through [`ClusterOps`]; the
//! default implementation routes arbitrary manifests through
//! `Api<DynamicObject>` with a process-wide discovery cache for GVK lookups.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams},
    core::{DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use nopea_core::{NopeaError, FIELD_MANAGER};
use once_cell::sync::Lazy;
use serde_json::Value as Json;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

#[async_trait]
pub trait ClusterOps: Send + Sync {
    /// GET one object; `Ok(None)` when it does not exist.
    async fn get_raw(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<Option<Json>, NopeaError>;

    /// Server-side apply with field manager `nopea`, force enabled.
    /// Returns the applied object as seen by the server.
    async fn apply(&self, manifest: &Json) -> Result<Json, NopeaError>;

    async fn delete(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<(), NopeaError>;

    /// Merge-patch the status subresource of a namespaced object.
    async fn patch_status(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
        namespace: &str,
        status: Json,
    ) -> Result<(), NopeaError>;

    /// Whether the kind is namespace-scoped.
    async fn is_namespaced(&self, api_version: &str, kind: &str) -> Result<bool, NopeaError>;
}

// Reuse a single kube Client across calls to avoid costly TLS/config setup.
static KUBE_CLIENT: OnceCell<Client> = OnceCell::const_new();

pub async fn shared_client() -> Result<Client, NopeaError> {
    KUBE_CLIENT
        .get_or_try_init(|| async {
            Client::try_default()
                .await
                .map_err(|e| NopeaError::Kube(format!("building kube client: {}", e)))
        })
        .await
        .cloned()
}

// Discovery cache: GVK key -> (ApiResource, namespaced)
static DISCOVERY_CACHE: Lazy<RwLock<HashMap<String, (kube::core::ApiResource, bool)>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

fn gvk_from(api_version: &str, kind: &str) -> GroupVersionKind {
    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    GroupVersionKind { group, version, kind: kind.to_string() }
}

fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

async fn find_api_resource(
    client: Client,
    gvk: &GroupVersionKind,
) -> Result<(kube::core::ApiResource, bool), NopeaError> {
    let key = gvk_key(gvk);
    if let Some((ar, ns)) = DISCOVERY_CACHE.read().unwrap().get(&key).cloned() {
        return Ok((ar, ns));
    }
    let discovery = Discovery::new(client)
        .run()
        .await
        .map_err(|e| NopeaError::Kube(format!("discovery: {}", e)))?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                DISCOVERY_CACHE.write().unwrap().insert(key, (ar.clone(), namespaced));
                return Ok((ar, namespaced));
            }
        }
    }
    Err(NopeaError::Kube(format!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind)))
}

/// kube-rs backed implementation of [`ClusterOps`].
#[derive(Debug, Clone, Default)]
pub struct KubeCluster;

impl KubeCluster {
    pub fn new() -> Self {
        Self
    }

    async fn dynamic_api(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
    ) -> Result<Api<DynamicObject>, NopeaError> {
        let client = shared_client().await?;
        let gvk = gvk_from(api_version, kind);
        let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
        let api = if namespaced {
            match namespace {
                Some(ns) => Api::namespaced_with(client, ns, &ar),
                None => Api::namespaced_with(client, "default", &ar),
            }
        } else {
            Api::all_with(client, &ar)
        };
        Ok(api)
    }
}

#[async_trait]
impl ClusterOps for KubeCluster {
    async fn get_raw(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<Option<Json>, NopeaError> {
        let api = self.dynamic_api(api_version, kind, namespace).await?;
        let obj = api
            .get_opt(name)
            .await
            .map_err(|e| NopeaError::Kube(format!("get {}/{} {}: {}", api_version, kind, name, e)))?;
        match obj {
            Some(o) => serde_json::to_value(&o)
                .map(Some)
                .map_err(|e| NopeaError::Kube(format!("serializing live object: {}", e))),
            None => Ok(None),
        }
    }

    async fn apply(&self, manifest: &Json) -> Result<Json, NopeaError> {
        let api_version = manifest
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .ok_or_else(|| NopeaError::Kube("manifest missing apiVersion".into()))?;
        let kind = manifest
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| NopeaError::Kube("manifest missing kind".into()))?;
        let meta = manifest.get("metadata").unwrap_or(&Json::Null);
        let name = meta
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| NopeaError::Kube("manifest missing metadata.name".into()))?;
        let namespace = meta.get("namespace").and_then(|v| v.as_str());

        let api = self.dynamic_api(api_version, kind, namespace).await?;
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        debug!(api_version, kind, name, ns = ?namespace, "server-side apply");
        let applied = api
            .patch(name, &pp, &Patch::Apply(manifest))
            .await
            .map_err(|e| NopeaError::Kube(format!("apply {}/{} {}: {}", api_version, kind, name, e)))?;
        serde_json::to_value(&applied)
            .map_err(|e| NopeaError::Kube(format!("serializing applied object: {}", e)))
    }

    async fn delete(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<(), NopeaError> {
        let api = self.dynamic_api(api_version, kind, namespace).await?;
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                warn!(api_version, kind, name, "delete of missing object ignored");
                Ok(())
            }
            Err(e) => Err(NopeaError::Kube(format!("delete {}/{} {}: {}", api_version, kind, name, e))),
        }
    }

    async fn patch_status(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
        namespace: &str,
        status: Json,
    ) -> Result<(), NopeaError> {
        let api = self.dynamic_api(api_version, kind, Some(namespace)).await?;
        let body = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map_err(|e| NopeaError::Kube(format!("status patch {}/{}: {}", kind, name, e)))?;
        Ok(())
    }

    async fn is_namespaced(&self, api_version: &str, kind: &str) -> Result<bool, NopeaError> {
        let client = shared_client().await?;
        let gvk = gvk_from(api_version, kind);
        let (_ar, namespaced) = find_api_resource(client, &gvk).await?;
        Ok(namespaced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_key_shapes() {
        let core = gvk_from("v1", "ConfigMap");
        assert_eq!(gvk_key(&core), "v1/ConfigMap");
        let grouped = gvk_from("apps/v1", "Deployment");
        assert_eq!(gvk_key(&grouped), "apps/v1/Deployment");
    }
}
