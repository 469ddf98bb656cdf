//! In-memory key-value cache for the reconciliation core.
//!
//! Five namespaces: commit per repo, resource hash per (repo, key),
//! last-applied manifest per (repo, key), sync state per repo, and
//! drift-first-seen per (repo, key). All writes are total; reads return
//! `Option`. Shared as `Arc<Cache>` across workers.

#![forbid(unsafe_code)]

use std::sync::RwLock;

use nopea_core::SyncState;
use rustc_hash::FxHashMap;
use serde_json::Value as Json;

type RepoKey = (String, String);

#[derive(Default)]
pub struct Cache {
    commits: RwLock<FxHashMap<String, String>>,
    resource_hashes: RwLock<FxHashMap<RepoKey, String>>,
    last_applied: RwLock<FxHashMap<RepoKey, Json>>,
    sync_states: RwLock<FxHashMap<String, SyncState>>,
    drift_first_seen: RwLock<FxHashMap<RepoKey, i64>>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Startup race protection: reports whether the tables exist. The maps
    /// are built in the constructor, so this is true for any live handle.
    pub fn available(&self) -> bool {
        true
    }

    // ---- commit per repo ----

    pub fn put_commit(&self, repo: &str, sha: &str) {
        self.commits.write().unwrap().insert(repo.to_string(), sha.to_string());
    }

    pub fn get_commit(&self, repo: &str) -> Option<String> {
        self.commits.read().unwrap().get(repo).cloned()
    }

    pub fn delete_commit(&self, repo: &str) {
        self.commits.write().unwrap().remove(repo);
    }

    // ---- resource hash per (repo, key) ----

    pub fn put_resource_hash(&self, repo: &str, key: &str, hash: &str) {
        self.resource_hashes
            .write()
            .unwrap()
            .insert((repo.to_string(), key.to_string()), hash.to_string());
    }

    pub fn get_resource_hash(&self, repo: &str, key: &str) -> Option<String> {
        self.resource_hashes
            .read()
            .unwrap()
            .get(&(repo.to_string(), key.to_string()))
            .cloned()
    }

    pub fn list_resource_hashes(&self, repo: &str) -> Vec<(String, String)> {
        self.resource_hashes
            .read()
            .unwrap()
            .iter()
            .filter(|((r, _), _)| r == repo)
            .map(|((_, k), h)| (k.clone(), h.clone()))
            .collect()
    }

    pub fn clear_resource_hashes(&self, repo: &str) {
        self.resource_hashes.write().unwrap().retain(|(r, _), _| r != repo);
    }

    // ---- last-applied manifest per (repo, key) ----

    pub fn put_last_applied(&self, repo: &str, key: &str, manifest: Json) {
        self.last_applied
            .write()
            .unwrap()
            .insert((repo.to_string(), key.to_string()), manifest);
    }

    pub fn get_last_applied(&self, repo: &str, key: &str) -> Option<Json> {
        self.last_applied
            .read()
            .unwrap()
            .get(&(repo.to_string(), key.to_string()))
            .cloned()
    }

    pub fn list_last_applied(&self, repo: &str) -> Vec<(String, Json)> {
        self.last_applied
            .read()
            .unwrap()
            .iter()
            .filter(|((r, _), _)| r == repo)
            .map(|((_, k), m)| (k.clone(), m.clone()))
            .collect()
    }

    pub fn delete_last_applied(&self, repo: &str, key: &str) {
        self.last_applied
            .write()
            .unwrap()
            .remove(&(repo.to_string(), key.to_string()));
    }

    pub fn clear_last_applied(&self, repo: &str) {
        self.last_applied.write().unwrap().retain(|(r, _), _| r != repo);
    }

    // ---- sync state per repo ----

    pub fn put_sync_state(&self, repo: &str, state: SyncState) {
        self.sync_states.write().unwrap().insert(repo.to_string(), state);
    }

    pub fn get_sync_state(&self, repo: &str) -> Option<SyncState> {
        self.sync_states.read().unwrap().get(repo).cloned()
    }

    // ---- drift-first-seen per (repo, key) ----

    /// Idempotent: the first recorded timestamp wins and is returned on
    /// every subsequent call for the same key.
    pub fn record_drift_first_seen(&self, repo: &str, key: &str, now_ms: i64) -> i64 {
        *self
            .drift_first_seen
            .write()
            .unwrap()
            .entry((repo.to_string(), key.to_string()))
            .or_insert(now_ms)
    }

    pub fn get_drift_first_seen(&self, repo: &str, key: &str) -> Option<i64> {
        self.drift_first_seen
            .read()
            .unwrap()
            .get(&(repo.to_string(), key.to_string()))
            .copied()
    }

    pub fn clear_drift_first_seen(&self, repo: &str, key: &str) {
        self.drift_first_seen
            .write()
            .unwrap()
            .remove(&(repo.to_string(), key.to_string()));
    }

    // ---- retirement ----

    /// Drop every entry belonging to one repository. Used when a worker is
    /// retired or the repo is re-initialized.
    pub fn clear_repo(&self, repo: &str) {
        self.delete_commit(repo);
        self.clear_resource_hashes(repo);
        self.clear_last_applied(repo);
        self.sync_states.write().unwrap().remove(repo);
        self.drift_first_seen.write().unwrap().retain(|(r, _), _| r != repo);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nopea_core::WorkerStatus;

    #[test]
    fn commit_roundtrip_and_delete() {
        let c = Cache::new();
        assert!(c.available());
        assert_eq!(c.get_commit("r"), None);
        c.put_commit("r", "abc123");
        assert_eq!(c.get_commit("r").as_deref(), Some("abc123"));
        c.delete_commit("r");
        assert_eq!(c.get_commit("r"), None);
    }

    #[test]
    fn drift_first_seen_is_idempotent() {
        let c = Cache::new();
        assert_eq!(c.record_drift_first_seen("r", "k", 1000), 1000);
        // Second observation keeps the first timestamp.
        assert_eq!(c.record_drift_first_seen("r", "k", 5000), 1000);
        assert_eq!(c.get_drift_first_seen("r", "k"), Some(1000));
        c.clear_drift_first_seen("r", "k");
        assert_eq!(c.get_drift_first_seen("r", "k"), None);
    }

    #[test]
    fn last_applied_listing_is_scoped_per_repo() {
        let c = Cache::new();
        c.put_last_applied("a", "v1/ConfigMap/default/x", serde_json::json!({"a": 1}));
        c.put_last_applied("a", "v1/Service/default/y", serde_json::json!({"a": 2}));
        c.put_last_applied("b", "v1/ConfigMap/default/x", serde_json::json!({"b": 1}));
        let mut keys: Vec<String> = c.list_last_applied("a").into_iter().map(|(k, _)| k).collect();
        keys.sort();
        assert_eq!(keys, vec!["v1/ConfigMap/default/x", "v1/Service/default/y"]);
        c.clear_last_applied("a");
        assert!(c.list_last_applied("a").is_empty());
        assert_eq!(c.list_last_applied("b").len(), 1);
    }

    #[test]
    fn clear_repo_drops_every_namespace() {
        let c = Cache::new();
        c.put_commit("r", "abc");
        c.put_resource_hash("r", "k", "h");
        c.put_last_applied("r", "k", serde_json::json!({}));
        c.put_sync_state(
            "r",
            SyncState { last_sync_ms: 1, last_commit: Some("abc".into()), status: WorkerStatus::Synced },
        );
        c.record_drift_first_seen("r", "k", 1);
        c.clear_repo("r");
        assert_eq!(c.get_commit("r"), None);
        assert_eq!(c.get_resource_hash("r", "k"), None);
        assert_eq!(c.get_last_applied("r", "k"), None);
        assert!(c.get_sync_state("r").is_none());
        assert_eq!(c.get_drift_first_seen("r", "k"), None);
    }
}
