//! Drift engine: manifest normalization, content hashing, three-way diff.
//!
//! Equality is decided by canonical-JSON hash rather than structural
//! deep-equal, so numeric encoding and map ordering cannot produce phantom
//! drift.

#![forbid(unsafe_code)]

use nopea_cache::Cache;
use nopea_core::{NopeaError, SUSPEND_HEAL_ANNOTATION};
use nopea_kube::ClusterOps;
use serde_json::Value as Json;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Metadata fields the API server mutates; stripped before hashing.
const NOISY_METADATA: &[&str] = &[
    "resourceVersion",
    "uid",
    "creationTimestamp",
    "generation",
    "managedFields",
    "selfLink",
];

const KUBECTL_LAST_APPLIED: &str = "kubectl.kubernetes.io/last-applied-configuration";

/// Classification of one manifest against its last-applied and live forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriftKind {
    NoDrift,
    /// No last-applied record and nothing live (or the live object was
    /// deleted): establishing baseline.
    NewResource,
    /// Live object exists but we have never applied it: establishing
    /// baseline over a pre-existing object.
    NeedsApply,
    /// Desired moved while the cluster still matches last-applied; an
    /// authorized change from the source of truth.
    GitChange { from: String, to: String },
    /// Cluster moved while git did not.
    ManualDrift { expected: String, actual: String },
    /// Both sides moved since the last apply.
    Conflict { last: String, desired: String, live: String },
}

/// Strip server-populated noise from a manifest (spec'd normalized form).
pub fn normalize(manifest: &Json) -> Json {
    let mut v = manifest.clone();
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for field in NOISY_METADATA {
            meta.remove(*field);
        }
        let drop_annotations = match meta.get_mut("annotations").and_then(|a| a.as_object_mut()) {
            Some(ann) => {
                ann.remove(KUBECTL_LAST_APPLIED);
                ann.is_empty()
            }
            None => false,
        };
        if drop_annotations {
            meta.remove("annotations");
        }
    }
    v
}

/// Deterministic compact JSON: object keys in lexicographic order, arrays in
/// input order, scalars via serde_json.
pub fn canonical_json(v: &Json) -> String {
    let mut out = String::new();
    write_canonical(v, &mut out);
    out
}

fn write_canonical(v: &Json, out: &mut String) {
    match v {
        Json::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, k) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(k).expect("string serializes"));
                out.push(':');
                write_canonical(&map[*k], out);
            }
            out.push('}');
        }
        Json::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar).expect("scalar serializes")),
    }
}

/// Hex sha256 over the canonical JSON of the normalized manifest.
pub fn content_hash(manifest: &Json) -> String {
    let canon = canonical_json(&normalize(manifest));
    hex::encode(Sha256::digest(canon.as_bytes()))
}

/// Three-way classification by content hash.
pub fn three_way(last_applied: &Json, desired: &Json, live: &Json) -> DriftKind {
    let last = content_hash(last_applied);
    let desired_h = content_hash(desired);
    let live_h = content_hash(live);
    match (desired_h == last, live_h == last) {
        (true, true) => DriftKind::NoDrift,
        (false, true) => DriftKind::GitChange { from: last, to: desired_h },
        (true, false) => DriftKind::ManualDrift { expected: last, actual: live_h },
        (false, false) => DriftKind::Conflict { last, desired: desired_h, live: live_h },
    }
}

/// True iff the live object carries the break-glass annotation with one of
/// the accepted values. A missing live object never suspends healing.
pub fn healing_suspended(live: Option<&Json>) -> bool {
    let Some(live) = live else { return false };
    live.get("metadata")
        .and_then(|m| m.get("annotations"))
        .and_then(|a| a.get(SUSPEND_HEAL_ANNOTATION))
        .and_then(|v| v.as_str())
        .map(|v| matches!(v, "true" | "1" | "yes"))
        .unwrap_or(false)
}

/// Stable identifier for a manifest within one repository.
pub fn resource_key(manifest: &Json) -> String {
    let api_version = manifest.get("apiVersion").and_then(|v| v.as_str()).unwrap_or("");
    let kind = manifest.get("kind").and_then(|v| v.as_str()).unwrap_or("");
    let meta = manifest.get("metadata").unwrap_or(&Json::Null);
    let namespace = meta.get("namespace").and_then(|v| v.as_str()).unwrap_or("default");
    let name = meta.get("name").and_then(|v| v.as_str()).unwrap_or("");
    format!("{}/{}/{}/{}", api_version, kind, namespace, name)
}

/// Fetch the live object for a desired manifest and classify drift against
/// the cached last-applied record.
pub async fn check_drift(
    repo: &str,
    desired: &Json,
    cluster: &dyn ClusterOps,
    cache: &Cache,
) -> Result<(DriftKind, Option<Json>), NopeaError> {
    let key = resource_key(desired);
    let last = cache.get_last_applied(repo, &key);

    let api_version = desired.get("apiVersion").and_then(|v| v.as_str()).unwrap_or("");
    let kind = desired.get("kind").and_then(|v| v.as_str()).unwrap_or("");
    let meta = desired.get("metadata").unwrap_or(&Json::Null);
    let name = meta.get("name").and_then(|v| v.as_str()).unwrap_or("");
    let namespace = meta.get("namespace").and_then(|v| v.as_str()).unwrap_or("default");
    let live = cluster.get_raw(api_version, kind, name, Some(namespace)).await?;

    let drift = match (&last, &live) {
        (None, None) => DriftKind::NewResource,
        (None, Some(_)) => DriftKind::NeedsApply,
        (Some(_), None) => DriftKind::NewResource,
        (Some(last), Some(live)) => three_way(last, desired, live),
    };
    debug!(repo, key = %key, drift = ?drift, "drift check");
    Ok((drift, live))
}
