//! Applier: multi-document YAML parsing and ordered server-side apply.

#![forbid(unsafe_code)]

use metrics::counter;
use nopea_core::NopeaError;
use nopea_drift::resource_key;
use nopea_kube::ClusterOps;
use serde::Deserialize;
use serde_json::Value as Json;
use std::collections::HashSet;
use tracing::debug;

/// One parsed manifest plus its stable resource-key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub key: String,
    pub value: Json,
}

impl Manifest {
    fn from_value(value: Json) -> Self {
        let key = resource_key(&value);
        Self { key, value }
    }
}

/// Split a multi-document YAML string into manifests. Empty documents are
/// discarded; every document must carry `apiVersion`, `kind`, and
/// `metadata.name`; duplicate resource-keys fail the whole parse.
pub fn parse_manifests(text: &str) -> Result<Vec<Manifest>, NopeaError> {
    let mut out = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for doc in serde_yaml::Deserializer::from_str(text) {
        let value = serde_yaml::Value::deserialize(doc)
            .map_err(|e| NopeaError::Parse(format!("invalid YAML: {}", e)))?;
        if value.is_null() {
            continue;
        }
        let json = serde_json::to_value(value)
            .map_err(|e| NopeaError::Parse(format!("YAML to JSON: {}", e)))?;
        validate_manifest(&json)?;
        let m = Manifest::from_value(json);
        if !seen.insert(m.key.clone()) {
            return Err(NopeaError::DuplicateKey(m.key));
        }
        out.push(m);
    }
    Ok(out)
}

fn validate_manifest(v: &Json) -> Result<(), NopeaError> {
    if v.get("apiVersion").and_then(|x| x.as_str()).is_none() {
        return Err(NopeaError::Parse("manifest missing apiVersion".into()));
    }
    if v.get("kind").and_then(|x| x.as_str()).is_none() {
        return Err(NopeaError::Parse("manifest missing kind".into()));
    }
    if v.get("metadata").and_then(|m| m.get("name")).and_then(|x| x.as_str()).is_none() {
        return Err(NopeaError::Parse("manifest missing metadata.name".into()));
    }
    Ok(())
}

/// Re-home namespaced manifests into `target_ns` and recompute their keys.
/// Cluster-scoped kinds pass through untouched.
pub async fn with_target_namespace(
    manifests: Vec<Manifest>,
    target_ns: &str,
    cluster: &dyn ClusterOps,
) -> Result<Vec<Manifest>, NopeaError> {
    let mut out = Vec::with_capacity(manifests.len());
    for mut m in manifests {
        let api_version = m.value.get("apiVersion").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let kind = m.value.get("kind").and_then(|v| v.as_str()).unwrap_or("").to_string();
        if cluster.is_namespaced(&api_version, &kind).await? {
            if let Some(meta) = m.value.get_mut("metadata").and_then(|x| x.as_object_mut()) {
                meta.insert("namespace".into(), Json::String(target_ns.to_string()));
            }
            m.key = resource_key(&m.value);
        }
        out.push(m);
    }
    Ok(out)
}

/// Apply one manifest, substituting the target namespace when the kind is
/// namespaced. Returns the server's view of the applied object.
pub async fn apply_single(
    cluster: &dyn ClusterOps,
    manifest: &Manifest,
    target_ns: Option<&str>,
) -> Result<Json, NopeaError> {
    let value = match target_ns {
        Some(ns) => {
            let rehomed = with_target_namespace(vec![manifest.clone()], ns, cluster).await?;
            rehomed.into_iter().next().expect("one manifest in, one out").value
        }
        None => manifest.value.clone(),
    };
    cluster.apply(&value).await
}

/// Apply manifests in input order; the first failure aborts the batch and
/// reports how many documents had already succeeded.
pub async fn apply_manifests(
    cluster: &dyn ClusterOps,
    manifests: &[Manifest],
    target_ns: Option<&str>,
) -> Result<usize, NopeaError> {
    let mut applied = 0usize;
    for m in manifests {
        match apply_single(cluster, m, target_ns).await {
            Ok(_) => {
                debug!(key = %m.key, "applied");
                applied += 1;
            }
            Err(e) => {
                counter!("nopea_apply_total", 1u64, "result" => "error");
                return Err(NopeaError::PartialApply { applied, reason: e.to_string() });
            }
        }
    }
    counter!("nopea_apply_total", 1u64, "result" => "ok");
    Ok(applied)
}
