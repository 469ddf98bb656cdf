//! The per-repository worker: a single task serializing every trigger
//! (startup, poll, reconcile, webhook, sync-now) over its own state.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{SecondsFormat, TimeZone, Utc};
use metrics::{counter, histogram};
use nopea_apply::{apply_manifests, apply_single, parse_manifests, with_target_namespace, Manifest};
use nopea_cache::Cache;
use nopea_core::{now_ms, sanitize_repo_dir, HealPolicy, NopeaError, RepoSpec, SyncState, SyncSummary, WorkerStatus};
use nopea_drift::{check_drift, content_hash, healing_suspended, normalize, DriftKind};
use nopea_events::{EventEmitter, EventFactory};
use nopea_git::GitOps;
use nopea_kube::ClusterOps;
use serde_json::Value as Json;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const REPO_API_VERSION: &str = "nopea.io/v1alpha1";
const REPO_KIND: &str = "GitRepository";

/// Triggers delivered through the worker mailbox.
#[derive(Debug)]
pub enum WorkerMsg {
    Poll,
    Reconcile,
    Webhook { commit: String },
    SyncNow { reply: oneshot::Sender<Result<SyncSummary, NopeaError>> },
}

/// Collaborators a worker needs; cheap to clone, shared across the fleet.
#[derive(Clone)]
pub struct WorkerDeps {
    pub git: Arc<dyn GitOps>,
    pub cluster: Arc<dyn ClusterOps>,
    pub cache: Arc<Cache>,
    pub emitter: EventEmitter,
    pub events: EventFactory,
    pub repo_base: PathBuf,
}

pub struct Worker {
    spec: RepoSpec,
    deps: WorkerDeps,
    repo_path: PathBuf,
    last_commit: Option<String>,
    status: WorkerStatus,
    first_sync_done: bool,
    reconcile_armed: bool,
}

impl Worker {
    pub fn new(spec: RepoSpec, deps: WorkerDeps) -> Self {
        let repo_path = deps.repo_base.join(sanitize_repo_dir(&spec.name));
        // After a crash restart the cache still holds the last applied
        // commit; picking it up keeps deployed/upgraded events honest.
        let last_commit = deps.cache.get_commit(&spec.name);
        let first_sync_done = last_commit.is_some();
        Self {
            spec,
            deps,
            repo_path,
            last_commit,
            status: WorkerStatus::Initializing,
            first_sync_done,
            reconcile_armed: false,
        }
    }

    fn environment_id(&self) -> &str {
        if self.spec.target_namespace.is_empty() { "default" } else { &self.spec.target_namespace }
    }

    /// Drive the worker until cancelled or the mailbox closes. Triggers are
    /// processed strictly one at a time.
    pub async fn run(mut self, rx: &mut mpsc::Receiver<WorkerMsg>, cancel: &CancellationToken) {
        info!(repo = %self.spec.name, suspended = self.spec.suspend, "worker starting");
        self.startup().await;

        let poll_period = Duration::from_millis(self.spec.poll_interval_ms.max(1));
        let mut poll = interval_at(Instant::now() + poll_period, poll_period);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let recon_period = Duration::from_millis(self.spec.reconcile_interval_ms().max(2));
        let mut reconcile = interval_at(Instant::now() + recon_period, recon_period);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                maybe = rx.recv() => match maybe {
                    Some(msg) => self.handle(msg).await,
                    None => break,
                },
                _ = poll.tick() => self.on_poll().await,
                _ = reconcile.tick() => {
                    if self.reconcile_armed {
                        self.on_reconcile().await;
                    }
                }
            }
        }
        info!(repo = %self.spec.name, "worker stopped");
    }

    async fn handle(&mut self, msg: WorkerMsg) {
        match msg {
            WorkerMsg::Poll => self.on_poll().await,
            WorkerMsg::Reconcile => self.on_reconcile().await,
            WorkerMsg::Webhook { commit } => {
                if self.spec.suspend {
                    return;
                }
                info!(repo = %self.spec.name, commit = %commit, "webhook trigger");
                let _ = self.do_sync().await;
            }
            WorkerMsg::SyncNow { reply } => {
                let result = if self.spec.suspend {
                    Err(NopeaError::Config("repository is suspended".into()))
                } else {
                    self.do_sync().await
                };
                let _ = reply.send(result);
            }
        }
    }

    async fn startup(&mut self) {
        if self.spec.suspend {
            return;
        }
        // On failure only the poll timer stays useful; the reconcile timer
        // is armed by the first successful sync.
        let _ = self.do_sync().await;
    }

    async fn on_poll(&mut self) {
        if self.spec.suspend {
            return;
        }
        match self.deps.git.remote_head(&self.spec.url, &self.spec.branch).await {
            Ok(head) => {
                if self.last_commit.as_deref() == Some(head.as_str()) {
                    debug!(repo = %self.spec.name, "poll: up to date");
                } else {
                    debug!(repo = %self.spec.name, head = %head, "poll: remote moved");
                    let _ = self.do_sync().await;
                }
            }
            Err(e) => {
                counter!("nopea_sync_error_total", 1u64,
                    "repo" => self.spec.name.clone(), "error" => e.kind());
                self.record_failure(&e).await;
            }
        }
    }

    // ---- sync ----

    async fn do_sync(&mut self) -> Result<SyncSummary, NopeaError> {
        let t0 = Instant::now();
        self.status = WorkerStatus::Syncing;
        self.patch_syncing().await;

        match self.sync_steps().await {
            Ok((sha, applied, previous)) => {
                let duration_ms = t0.elapsed().as_millis() as u64;
                histogram!("nopea_sync_duration_seconds", t0.elapsed().as_secs_f64(),
                    "repo" => self.spec.name.clone());
                counter!("nopea_sync_total", 1u64,
                    "repo" => self.spec.name.clone(), "status" => "ok");

                let ev = if self.first_sync_done {
                    self.deps.events.service_upgraded(
                        &self.spec.name,
                        self.environment_id(),
                        &sha,
                        previous.as_deref(),
                        applied,
                        duration_ms,
                    )
                } else {
                    self.deps.events.service_deployed(
                        &self.spec.name,
                        self.environment_id(),
                        &sha,
                        applied,
                        duration_ms,
                    )
                };
                self.deps.emitter.emit(ev);
                self.first_sync_done = true;

                self.patch_synced(&sha, applied).await;
                info!(repo = %self.spec.name, commit = %sha, applied, duration_ms, "sync complete");
                Ok(SyncSummary { commit: sha, applied, duration_ms })
            }
            Err(e) => {
                histogram!("nopea_sync_duration_seconds", t0.elapsed().as_secs_f64(),
                    "repo" => self.spec.name.clone());
                counter!("nopea_sync_total", 1u64,
                    "repo" => self.spec.name.clone(), "status" => "error");
                counter!("nopea_sync_error_total", 1u64,
                    "repo" => self.spec.name.clone(), "error" => e.kind());
                self.record_failure(&e).await;
                Err(e)
            }
        }
    }

    /// Clone/fetch, parse the tree, apply everything, then move the
    /// worker's commit forward. `last_commit` only advances after the whole
    /// batch applied.
    async fn sync_steps(&mut self) -> Result<(String, usize, Option<String>), NopeaError> {
        let sha = self
            .deps
            .git
            .sync(&self.spec.url, &self.spec.branch, &self.repo_path)
            .await?;

        let desired = self.load_desired().await?;
        let applied = apply_manifests(self.deps.cluster.as_ref(), &desired, None).await?;

        for m in &desired {
            self.deps
                .cache
                .put_last_applied(&self.spec.name, &m.key, normalize(&m.value));
            self.deps
                .cache
                .put_resource_hash(&self.spec.name, &m.key, &content_hash(&m.value));
        }

        let previous = self.last_commit.replace(sha.clone());
        self.status = WorkerStatus::Synced;
        self.reconcile_armed = true;
        self.deps.cache.put_commit(&self.spec.name, &sha);
        self.deps.cache.put_sync_state(
            &self.spec.name,
            SyncState {
                last_sync_ms: now_ms(),
                last_commit: Some(sha.clone()),
                status: WorkerStatus::Synced,
            },
        );
        Ok((sha, applied, previous))
    }

    /// Read the tree of the last clone into target-namespaced manifests.
    /// Parse failures across files are aggregated; any failure fails the lot.
    async fn load_desired(&self) -> Result<Vec<Manifest>, NopeaError> {
        let files = self
            .deps
            .git
            .list_files(&self.repo_path, self.spec.subpath.as_deref())
            .await?;

        let mut manifests: Vec<Manifest> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut errors: Vec<String> = Vec::new();
        for file in &files {
            let bytes = self.deps.git.read_blob(&self.repo_path, file).await?;
            let text = match String::from_utf8(bytes) {
                Ok(t) => t,
                Err(_) => {
                    errors.push(format!("{}: not valid UTF-8", file.display()));
                    continue;
                }
            };
            match parse_manifests(&text) {
                Ok(ms) => {
                    for m in ms {
                        if !seen.insert(m.key.clone()) {
                            return Err(NopeaError::DuplicateKey(m.key));
                        }
                        manifests.push(m);
                    }
                }
                Err(e) => errors.push(format!("{}: {}", file.display(), e)),
            }
        }
        if !errors.is_empty() {
            return Err(NopeaError::Parse(errors.join("; ")));
        }
        with_target_namespace(manifests, &self.spec.target_namespace, self.deps.cluster.as_ref()).await
    }

    // ---- reconcile & healing ----

    async fn on_reconcile(&mut self) {
        if self.spec.suspend {
            return;
        }
        let desired = match self.load_desired().await {
            Ok(d) => d,
            Err(e) => {
                warn!(repo = %self.spec.name, error = %e, "reconcile: cannot load desired tree");
                counter!("nopea_sync_error_total", 1u64,
                    "repo" => self.spec.name.clone(), "error" => e.kind());
                return;
            }
        };
        debug!(repo = %self.spec.name, manifests = desired.len(), "reconcile pass");
        for m in &desired {
            match check_drift(&self.spec.name, &m.value, self.deps.cluster.as_ref(), &self.deps.cache).await {
                Ok((kind, live)) => self.heal(m, kind, live).await,
                Err(e) => {
                    warn!(repo = %self.spec.name, key = %m.key, error = %e, "drift check failed");
                }
            }
        }
    }

    /// Healing decision matrix: policy x drift x break-glass x grace.
    async fn heal(&mut self, m: &Manifest, kind: DriftKind, live: Option<Json>) {
        match kind {
            DriftKind::NoDrift => {
                // Drift disappeared on its own; forget any pending grace.
                self.deps.cache.clear_drift_first_seen(&self.spec.name, &m.key);
            }
            DriftKind::NewResource | DriftKind::NeedsApply => {
                // Establishing baseline, not healing.
                self.apply_one(m).await;
            }
            DriftKind::GitChange { .. } => {
                // Authorized change from the source of truth; only the
                // break-glass annotation can stop it.
                if healing_suspended(live.as_ref()) {
                    debug!(repo = %self.spec.name, key = %m.key, "git change held by break-glass");
                } else {
                    self.apply_one(m).await;
                }
            }
            DriftKind::ManualDrift { .. } | DriftKind::Conflict { .. } => {
                counter!("nopea_drift_detected_total", 1u64,
                    "repo" => self.spec.name.clone(), "resource" => m.key.clone());
                if self.spec.heal_policy != HealPolicy::Auto {
                    debug!(repo = %self.spec.name, key = %m.key, policy = ?self.spec.heal_policy,
                        "cluster drift left alone by policy");
                    return;
                }
                if healing_suspended(live.as_ref()) {
                    debug!(repo = %self.spec.name, key = %m.key, "healing suspended by break-glass");
                    return;
                }
                let now = now_ms();
                let first = self.deps.cache.record_drift_first_seen(&self.spec.name, &m.key, now);
                let grace = self.spec.heal_grace_period_ms.unwrap_or(0) as i64;
                if now - first < grace {
                    debug!(repo = %self.spec.name, key = %m.key, remaining_ms = grace - (now - first),
                        "healing waits for grace period");
                    return;
                }
                if self.apply_one(m).await {
                    self.deps.cache.clear_drift_first_seen(&self.spec.name, &m.key);
                    counter!("nopea_drift_healed_total", 1u64,
                        "repo" => self.spec.name.clone(), "resource" => m.key.clone());
                }
            }
        }
    }

    async fn apply_one(&mut self, m: &Manifest) -> bool {
        match apply_single(self.deps.cluster.as_ref(), m, None).await {
            Ok(_) => {
                self.deps
                    .cache
                    .put_last_applied(&self.spec.name, &m.key, normalize(&m.value));
                self.deps
                    .cache
                    .put_resource_hash(&self.spec.name, &m.key, &content_hash(&m.value));
                true
            }
            Err(e) => {
                warn!(repo = %self.spec.name, key = %m.key, error = %e, "apply failed");
                counter!("nopea_sync_error_total", 1u64,
                    "repo" => self.spec.name.clone(), "error" => e.kind());
                false
            }
        }
    }

    // ---- failure handling & CRD status ----

    async fn record_failure(&mut self, error: &NopeaError) {
        self.status = WorkerStatus::Failed;
        // last_commit stays where it was: nothing new applied.
        self.deps.cache.put_sync_state(
            &self.spec.name,
            SyncState {
                last_sync_ms: now_ms(),
                last_commit: self.last_commit.clone(),
                status: WorkerStatus::Failed,
            },
        );
        let wire = error.to_wire();
        self.deps.emitter.emit(self.deps.events.sync_failed(
            &self.spec.name,
            self.environment_id(),
            self.last_commit.as_deref(),
            &wire,
        ));
        let status = self.status_json(condition("Ready", false, error.kind(), &error.to_string()));
        self.patch_status(status).await;
        warn!(repo = %self.spec.name, error = %error, kind = error.kind(), "sync failed");
    }

    async fn patch_syncing(&self) {
        let status = self.status_json(condition("Progressing", true, "SyncStarted", "sync in progress"));
        self.patch_status(status).await;
    }

    async fn patch_synced(&self, commit: &str, applied: usize) {
        let mut status =
            self.status_json(condition("Ready", true, "Synced", &format!("Applied {} manifests", applied)));
        status["lastAppliedCommit"] = Json::String(commit.to_string());
        self.patch_status(status).await;
    }

    fn status_json(&self, condition: Json) -> Json {
        let mut status = serde_json::json!({
            "phase": self.status.phase(),
            "lastSyncTime": rfc3339_now(),
            "conditions": [condition],
        });
        if let Some(commit) = &self.last_commit {
            status["lastAppliedCommit"] = Json::String(commit.clone());
        }
        if let Some(generation) = self.spec.generation {
            status["observedGeneration"] = Json::from(generation);
        }
        status
    }

    /// Status patches are best-effort; the next trigger repeats them.
    async fn patch_status(&self, status: Json) {
        if let Err(e) = self
            .deps
            .cluster
            .patch_status(REPO_API_VERSION, REPO_KIND, &self.spec.name, &self.spec.namespace, status)
            .await
        {
            warn!(repo = %self.spec.name, error = %e, "status patch failed");
        }
    }
}

fn condition(ty: &str, ok: bool, reason: &str, message: &str) -> Json {
    let status = if ok { "True" } else { "False" };
    serde_json::json!({
        "type": ty,
        "status": status,
        "lastTransitionTime": rfc3339_now(),
        "reason": reason,
        "message": message,
    })
}

fn rfc3339_now() -> String {
    Utc.timestamp_millis_opt(now_ms())
        .single()
        .unwrap_or_else(Utc::now)
        .to_rfc3339_opts(SecondsFormat::Secs, true)
}
