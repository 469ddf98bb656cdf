//! Fake collaborators shared by the worker integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nopea_cache::Cache;
use nopea_core::{HealPolicy, NopeaError, RepoSpec};
use nopea_events::{spawn_emitter, EmitterConfig, EventFactory, HttpPoster, IdGenerator};
use nopea_git::GitOps;
use nopea_kube::ClusterOps;
use nopea_worker::{Worker, WorkerDeps, WorkerMsg};
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const THREE_DOCS: &str = r#"apiVersion: apps/v1
kind: Deployment
metadata:
  name: api
---
apiVersion: v1
kind: Service
metadata:
  name: api
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: api-config
data:
  LOG_LEVEL: info
"#;

pub struct FakeGit {
    pub head: Mutex<String>,
    pub files: Mutex<Vec<(PathBuf, String)>>,
    pub fail: AtomicBool,
}

impl FakeGit {
    pub fn new(head: &str, files: Vec<(&str, &str)>) -> Self {
        Self {
            head: Mutex::new(head.to_string()),
            files: Mutex::new(
                files.into_iter().map(|(p, c)| (PathBuf::from(p), c.to_string())).collect(),
            ),
            fail: AtomicBool::new(false),
        }
    }

    pub fn set_head(&self, head: &str) {
        *self.head.lock().unwrap() = head.to_string();
    }

    pub fn set_file(&self, path: &str, content: &str) {
        let mut files = self.files.lock().unwrap();
        if let Some(entry) = files.iter_mut().find(|(p, _)| p == Path::new(path)) {
            entry.1 = content.to_string();
        } else {
            files.push((PathBuf::from(path), content.to_string()));
        }
    }
}

#[async_trait]
impl GitOps for FakeGit {
    async fn sync(&self, _url: &str, _branch: &str, _dest: &Path) -> Result<String, NopeaError> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(NopeaError::Git("network timeout".into()));
        }
        Ok(self.head.lock().unwrap().clone())
    }

    async fn remote_head(&self, _url: &str, _branch: &str) -> Result<String, NopeaError> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(NopeaError::Git("network timeout".into()));
        }
        Ok(self.head.lock().unwrap().clone())
    }

    async fn list_files(&self, _dest: &Path, _subpath: Option<&str>) -> Result<Vec<PathBuf>, NopeaError> {
        Ok(self.files.lock().unwrap().iter().map(|(p, _)| p.clone()).collect())
    }

    async fn read_blob(&self, _dest: &Path, rel: &Path) -> Result<Vec<u8>, NopeaError> {
        self.files
            .lock()
            .unwrap()
            .iter()
            .find(|(p, _)| p == rel)
            .map(|(_, c)| c.as_bytes().to_vec())
            .ok_or_else(|| NopeaError::Git(format!("no such file: {}", rel.display())))
    }

    async fn head(&self, _dest: &Path) -> Result<String, NopeaError> {
        Ok(self.head.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct FakeCluster {
    pub objects: Mutex<HashMap<String, Json>>,
    pub applies: Mutex<Vec<String>>,
    pub gets: Mutex<u64>,
    pub statuses: Mutex<Vec<Json>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_live(&self, manifest: Json) {
        let key = nopea_drift::resource_key(&manifest);
        self.objects.lock().unwrap().insert(key, manifest);
    }

    pub fn live(&self, key: &str) -> Option<Json> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn apply_count(&self) -> usize {
        self.applies.lock().unwrap().len()
    }

    pub fn get_count(&self) -> u64 {
        *self.gets.lock().unwrap()
    }

    pub fn phases(&self) -> Vec<String> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .filter_map(|s| s.get("phase").and_then(|p| p.as_str()).map(String::from))
            .collect()
    }
}

#[async_trait]
impl ClusterOps for FakeCluster {
    async fn get_raw(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<Option<Json>, NopeaError> {
        *self.gets.lock().unwrap() += 1;
        let key = format!("{}/{}/{}/{}", api_version, kind, namespace.unwrap_or("default"), name);
        Ok(self.objects.lock().unwrap().get(&key).cloned())
    }

    async fn apply(&self, manifest: &Json) -> Result<Json, NopeaError> {
        let key = nopea_drift::resource_key(manifest);
        self.applies.lock().unwrap().push(key.clone());
        self.objects.lock().unwrap().insert(key, manifest.clone());
        Ok(manifest.clone())
    }

    async fn delete(
        &self,
        api_version: &str,
        kind: &str,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<(), NopeaError> {
        let key = format!("{}/{}/{}/{}", api_version, kind, namespace.unwrap_or("default"), name);
        self.objects.lock().unwrap().remove(&key);
        Ok(())
    }

    async fn patch_status(
        &self,
        _api_version: &str,
        _kind: &str,
        _name: &str,
        _namespace: &str,
        status: Json,
    ) -> Result<(), NopeaError> {
        self.statuses.lock().unwrap().push(status);
        Ok(())
    }

    async fn is_namespaced(&self, _api_version: &str, kind: &str) -> Result<bool, NopeaError> {
        Ok(kind != "Namespace" && kind != "ClusterRole")
    }
}

/// Poster that accepts everything and keeps the CloudEvents bodies.
#[derive(Default)]
pub struct RecordingPoster {
    pub bodies: Mutex<Vec<Json>>,
}

impl RecordingPoster {
    pub fn event_types(&self) -> Vec<String> {
        self.bodies
            .lock()
            .unwrap()
            .iter()
            .filter_map(|b| b.get("type").and_then(|t| t.as_str()).map(String::from))
            .collect()
    }

    pub fn find_event(&self, ty: &str) -> Option<Json> {
        self.bodies
            .lock()
            .unwrap()
            .iter()
            .find(|b| b.get("type").and_then(|t| t.as_str()) == Some(ty))
            .cloned()
    }
}

#[async_trait]
impl HttpPoster for RecordingPoster {
    async fn post(&self, _url: &str, _content_type: &str, body: String) -> Result<u16, String> {
        let v: Json = serde_json::from_str(&body).map_err(|e| e.to_string())?;
        self.bodies.lock().unwrap().push(v);
        Ok(200)
    }
}

pub struct Rig {
    pub git: Arc<FakeGit>,
    pub cluster: Arc<FakeCluster>,
    pub cache: Arc<Cache>,
    pub poster: Arc<RecordingPoster>,
    pub tx: mpsc::Sender<WorkerMsg>,
    pub cancel: CancellationToken,
}

pub fn repo_spec(name: &str) -> RepoSpec {
    RepoSpec {
        name: name.to_string(),
        namespace: "gitops".to_string(),
        url: format!("https://git.example.com/{}.git", name),
        branch: "main".to_string(),
        subpath: None,
        target_namespace: "prod".to_string(),
        // Long intervals: tests drive triggers through the mailbox.
        poll_interval_ms: 3_600_000,
        heal_policy: HealPolicy::Auto,
        heal_grace_period_ms: None,
        suspend: false,
        generation: Some(1),
    }
}

/// Spawn a worker over fresh fakes and return the handles for steering it.
pub fn spawn_rig(spec: RepoSpec, git: Arc<FakeGit>) -> Rig {
    let cluster = Arc::new(FakeCluster::new());
    let cache = Arc::new(Cache::new());
    let poster = Arc::new(RecordingPoster::default());
    let (emitter, _task) = spawn_emitter(
        EmitterConfig {
            endpoint: Some("http://sink.test/events".into()),
            retry_delay_ms: 10,
            max_retries: 3,
            queue_cap: 64,
        },
        poster.clone(),
    );
    let ids = Arc::new(IdGenerator::new());
    let deps = WorkerDeps {
        git: git.clone(),
        cluster: cluster.clone(),
        cache: cache.clone(),
        emitter,
        events: EventFactory::new(ids),
        repo_base: std::env::temp_dir().join("nopea-worker-tests"),
    };
    let (tx, mut rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let cancel_task = cancel.clone();
    tokio::spawn(async move {
        Worker::new(spec, deps).run(&mut rx, &cancel_task).await;
    });
    Rig { git, cluster, cache, poster, tx, cancel }
}

/// Poll until `cond` holds; panics after two seconds.
pub async fn wait_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {}", what);
}

/// Barrier for reconcile assertions: wait until the drift checks ran, then
/// give the final heal decision a moment to land.
pub async fn settle_reconcile(cluster: &FakeCluster, gets_before: u64, manifests: u64) {
    let target = gets_before + manifests;
    wait_until("reconcile drift checks", || cluster.get_count() >= target).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
}
