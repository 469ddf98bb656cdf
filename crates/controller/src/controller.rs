//! Watch loop and worker-set reconciliation, gated on leadership.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::TryStreamExt;
use kube::{
    api::{Api, ListParams},
    runtime::watcher::{self, Event},
};
use metrics::{counter, gauge};
use nopea_worker::Fleet;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crd::{repo_spec_from, GitRepository};

/// Leadership signal. With election disabled the receiver is pinned to
/// `true`; an external elector drives the sender otherwise.
pub fn leader_channel(initially_leader: bool) -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(initially_leader)
}

pub struct Controller {
    fleet: Arc<Fleet>,
    /// Namespace to watch; empty means all namespaces.
    namespace: String,
    leader_rx: watch::Receiver<bool>,
    ready: Arc<AtomicBool>,
    pod: String,
}

impl Controller {
    pub fn new(
        fleet: Arc<Fleet>,
        namespace: String,
        leader_rx: watch::Receiver<bool>,
        ready: Arc<AtomicBool>,
    ) -> Self {
        let pod = std::env::var("NOPEA_POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| "nopea".to_string());
        Self { fleet, namespace, leader_rx, ready, pod }
    }

    async fn api(&self) -> Result<Api<GitRepository>> {
        let client = nopea_kube::shared_client().await?;
        Ok(if self.namespace.is_empty() {
            Api::all(client)
        } else {
            Api::namespaced(client, &self.namespace)
        })
    }

    /// Run until cancelled. While not leader: no watch, no workers.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let backoff_max: u64 = nopea_core::env::u64_var("NOPEA_WATCH_BACKOFF_MAX_SECS", 30);
        let mut backoff: u64 = 1;
        let mut was_leader = false;
        let mut needs_resync = false;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let is_leader = *self.leader_rx.borrow();
            if is_leader != was_leader {
                counter!("nopea_leader_transitions_total", 1u64, "pod" => self.pod.clone());
                if is_leader {
                    info!("acquired leadership");
                    needs_resync = true;
                } else {
                    info!("lost leadership; stopping all workers");
                    self.fleet.stop_all().await;
                }
                was_leader = is_leader;
            }
            gauge!("nopea_leader_status", if is_leader { 1.0 } else { 0.0 }, "pod" => self.pod.clone());

            if !is_leader {
                self.ready.store(false, Ordering::SeqCst);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = self.leader_rx.changed() => {
                        if changed.is_err() {
                            return Err(anyhow!("leader election channel closed"));
                        }
                    }
                }
                continue;
            }

            if needs_resync {
                if let Err(e) = self.resync().await {
                    warn!(error = %e, "resync failed; will retry");
                    tokio::time::sleep(Duration::from_secs(backoff.min(backoff_max))).await;
                    backoff = (backoff * 2).min(backoff_max);
                    continue;
                }
                needs_resync = false;
                backoff = 1;
            }

            match self.watch(&cancel).await {
                Ok(()) => {
                    // Cancelled or leadership flipped; loop re-evaluates.
                    backoff = 1;
                }
                Err(e) => {
                    warn!(error = %e, "watch stream error; will backoff and restart");
                    counter!("nopea_watch_errors_total", 1u64);
                    self.ready.store(false, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(backoff.min(backoff_max))).await;
                    backoff = (backoff * 2).min(backoff_max).max(1);
                }
            }
        }

        self.ready.store(false, Ordering::SeqCst);
        self.fleet.stop_all().await;
        Ok(())
    }

    /// List the declared set and reconcile workers against it.
    async fn resync(&self) -> Result<()> {
        let api = self.api().await?;
        let list = api.list(&ListParams::default()).await?;
        info!(declared = list.items.len(), "resync listing complete");
        self.reconcile_set(list.items).await;
        Ok(())
    }

    async fn watch(&mut self, cancel: &CancellationToken) -> Result<()> {
        let api = self.api().await?;
        let stream = watcher::watcher(api, watcher::Config::default());
        futures::pin_mut!(stream);
        self.ready.store(true, Ordering::SeqCst);
        info!(ns = %if self.namespace.is_empty() { "<all>" } else { &self.namespace }, "watching GitRepository resources");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                changed = self.leader_rx.changed() => {
                    if changed.is_err() {
                        return Err(anyhow!("leader election channel closed"));
                    }
                    if !*self.leader_rx.borrow() {
                        info!("leadership changed during watch");
                        self.ready.store(false, Ordering::SeqCst);
                        return Ok(());
                    }
                }
                maybe = stream.try_next() => match maybe {
                    Ok(Some(Event::Applied(cr))) => self.upsert(&cr).await,
                    Ok(Some(Event::Deleted(cr))) => self.remove(&cr).await,
                    Ok(Some(Event::Restarted(list))) => {
                        debug!(count = list.len(), "watch restarted; reconciling full set");
                        self.reconcile_set(list).await;
                    }
                    Ok(None) => return Err(anyhow!("watch stream ended")),
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }

    /// ADDED or MODIFIED: start the worker, or respawn it when a
    /// semantically significant field changed.
    async fn upsert(&self, cr: &GitRepository) {
        let Some(spec) = repo_spec_from(cr) else {
            warn!("GitRepository without a name ignored");
            return;
        };
        match self.fleet.get_worker(&spec.name).await {
            None => {
                info!(repo = %spec.name, "starting worker for declared repository");
                if let Err(e) = self.fleet.start_worker(spec).await {
                    warn!(error = %e, "worker start failed");
                }
            }
            Some(running) => {
                if running.significant_change(&spec) {
                    info!(repo = %spec.name, "spec changed; respawning worker");
                    if let Err(e) = self.fleet.stop_worker(&spec.name).await {
                        warn!(error = %e, "worker stop failed");
                    }
                    if let Err(e) = self.fleet.start_worker(spec).await {
                        warn!(error = %e, "worker restart failed");
                    }
                } else {
                    debug!(repo = %spec.name, "no significant change");
                }
            }
        }
    }

    async fn remove(&self, cr: &GitRepository) {
        let Some(name) = cr.metadata.name.clone() else { return };
        info!(repo = %name, "declared repository deleted; retiring worker");
        if let Err(e) = self.fleet.stop_worker(&name).await {
            warn!(error = %e, "worker stop failed");
        }
    }

    /// Diff the declared set against the registry: retire undeclared
    /// workers, then upsert every declared repository.
    async fn reconcile_set(&self, declared: Vec<GitRepository>) {
        let declared_names: HashMap<String, &GitRepository> = declared
            .iter()
            .filter_map(|cr| cr.metadata.name.clone().map(|n| (n, cr)))
            .collect();

        for (name, _spec) in self.fleet.list_workers().await {
            if !declared_names.contains_key(&name) {
                info!(repo = %name, "worker no longer declared; retiring");
                let _ = self.fleet.stop_worker(&name).await;
            }
        }
        for cr in declared_names.values() {
            self.upsert(cr).await;
        }
    }
}
