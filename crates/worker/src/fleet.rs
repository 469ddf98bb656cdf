//! Fleet supervisor: one worker per declared repository, one-for-one
//! restarts, unique-name registry.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use metrics::{counter, gauge};
use nopea_core::{NopeaError, RepoSpec, SyncSummary};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::worker::{Worker, WorkerDeps, WorkerMsg};
use crate::SYNC_NOW_TIMEOUT_SECS;

const MAILBOX_CAP: usize = 16;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("worker already started: {0}")]
    AlreadyStarted(String),
    #[error("worker not found: {0}")]
    NotFound(String),
    #[error("sync_now timed out after {}s", SYNC_NOW_TIMEOUT_SECS)]
    Timeout,
    #[error("worker unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Sync(#[from] NopeaError),
}

struct WorkerHandle {
    spec: RepoSpec,
    tx: mpsc::Sender<WorkerMsg>,
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

pub struct Fleet {
    deps: WorkerDeps,
    workers: Mutex<HashMap<String, WorkerHandle>>,
}

impl Fleet {
    pub fn new(deps: WorkerDeps) -> Self {
        Self { deps, workers: Mutex::new(HashMap::new()) }
    }

    /// Spawn a worker for `spec`. Names are unique across the fleet.
    pub async fn start_worker(&self, spec: RepoSpec) -> Result<(), FleetError> {
        let mut workers = self.workers.lock().await;
        if workers.contains_key(&spec.name) {
            return Err(FleetError::AlreadyStarted(spec.name));
        }
        let (tx, rx) = mpsc::channel(MAILBOX_CAP);
        let cancel = CancellationToken::new();
        let join = tokio::spawn(supervise(spec.clone(), self.deps.clone(), rx, cancel.clone()));
        info!(repo = %spec.name, "worker registered");
        workers.insert(spec.name.clone(), WorkerHandle { spec, tx, cancel, join });
        gauge!("nopea_workers_active", workers.len() as f64);
        Ok(())
    }

    /// Cancel a worker, wait for it to wind down, and retire its cache.
    pub async fn stop_worker(&self, name: &str) -> Result<(), FleetError> {
        let handle = {
            let mut workers = self.workers.lock().await;
            let handle = workers.remove(name).ok_or_else(|| FleetError::NotFound(name.to_string()))?;
            gauge!("nopea_workers_active", workers.len() as f64);
            handle
        };
        handle.cancel.cancel();
        if handle.join.await.is_err() {
            warn!(repo = %name, "worker task ended abnormally during stop");
        }
        self.deps.cache.clear_repo(name);
        info!(repo = %name, "worker retired");
        Ok(())
    }

    pub async fn stop_all(&self) {
        let names: Vec<String> = self.workers.lock().await.keys().cloned().collect();
        for name in names {
            let _ = self.stop_worker(&name).await;
        }
    }

    pub async fn list_workers(&self) -> Vec<(String, RepoSpec)> {
        self.workers
            .lock()
            .await
            .iter()
            .map(|(name, h)| (name.clone(), h.spec.clone()))
            .collect()
    }

    pub async fn get_worker(&self, name: &str) -> Option<RepoSpec> {
        self.workers.lock().await.get(name).map(|h| h.spec.clone())
    }

    /// Out-of-band steer from the webhook endpoint; best-effort, returns
    /// whether a worker was found and notified.
    pub async fn notify_webhook(&self, name: &str, commit: &str) -> bool {
        let workers = self.workers.lock().await;
        match workers.get(name) {
            Some(h) => h.tx.try_send(WorkerMsg::Webhook { commit: commit.to_string() }).is_ok(),
            None => false,
        }
    }

    /// Blocking sync: waits for every previously queued trigger, then the
    /// sync itself. Bounded by [`SYNC_NOW_TIMEOUT_SECS`]; on timeout the
    /// in-flight sync keeps running on its own.
    pub async fn sync_now(&self, name: &str) -> Result<SyncSummary, FleetError> {
        let tx = {
            let workers = self.workers.lock().await;
            workers.get(name).ok_or_else(|| FleetError::NotFound(name.to_string()))?.tx.clone()
        };
        let (reply, rx) = oneshot::channel();
        tx.send(WorkerMsg::SyncNow { reply })
            .await
            .map_err(|_| FleetError::Unavailable(name.to_string()))?;
        match tokio::time::timeout(Duration::from_secs(SYNC_NOW_TIMEOUT_SECS), rx).await {
            Err(_) => Err(FleetError::Timeout),
            Ok(Err(_)) => Err(FleetError::Unavailable(name.to_string())),
            Ok(Ok(result)) => result.map_err(FleetError::from),
        }
    }
}

/// One-for-one restart wrapper: a panicking worker is rebuilt and re-runs
/// its startup sync; its mailbox survives the restart.
async fn supervise(
    spec: RepoSpec,
    deps: WorkerDeps,
    mut rx: mpsc::Receiver<WorkerMsg>,
    cancel: CancellationToken,
) {
    loop {
        let worker = Worker::new(spec.clone(), deps.clone());
        let outcome = AssertUnwindSafe(worker.run(&mut rx, &cancel)).catch_unwind().await;
        match outcome {
            Ok(()) => break,
            Err(_) => {
                counter!("nopea_worker_restarts_total", 1u64, "repo" => spec.name.clone());
                warn!(repo = %spec.name, "worker panicked; restarting");
                if cancel.is_cancelled() {
                    break;
                }
            }
        }
    }
}
