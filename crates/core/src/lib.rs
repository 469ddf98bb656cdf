//! Nopea core types: repository declarations, worker state, error taxonomy.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub mod error;

pub use error::NopeaError;

/// Default poll interval when the declaration carries none (5 minutes).
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 300_000;

/// Annotation a live object carries to opt out of healing.
pub const SUSPEND_HEAL_ANNOTATION: &str = "nopea.io/suspend-heal";

/// Field manager used for server-side apply.
pub const FIELD_MANAGER: &str = "nopea";

/// How cluster-side drift is handled for a repository.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealPolicy {
    #[default]
    Auto,
    Manual,
    Notify,
}

impl HealPolicy {
    /// Lenient parse: anything unrecognized falls back to `auto`.
    pub fn parse(s: &str) -> Self {
        match s {
            "manual" => HealPolicy::Manual,
            "notify" => HealPolicy::Notify,
            _ => HealPolicy::Auto,
        }
    }
}

/// One declared repository, produced by the controller from a `GitRepository`
/// custom resource. Workers key themselves by `name`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepoSpec {
    pub name: String,
    pub namespace: String,
    pub url: String,
    pub branch: String,
    pub subpath: Option<String>,
    pub target_namespace: String,
    pub poll_interval_ms: u64,
    pub heal_policy: HealPolicy,
    pub heal_grace_period_ms: Option<u64>,
    pub suspend: bool,
    /// `metadata.generation` of the source resource, reflected back into
    /// `status.observedGeneration`.
    pub generation: Option<i64>,
}

impl RepoSpec {
    pub fn reconcile_interval_ms(&self) -> u64 {
        self.poll_interval_ms.saturating_mul(2)
    }

    /// Fields whose change requires the worker to be restarted.
    pub fn significant_change(&self, other: &RepoSpec) -> bool {
        self.url != other.url
            || self.branch != other.branch
            || self.subpath != other.subpath
            || self.target_namespace != other.target_namespace
            || self.poll_interval_ms != other.poll_interval_ms
            || self.heal_policy != other.heal_policy
            || self.heal_grace_period_ms != other.heal_grace_period_ms
            || self.suspend != other.suspend
    }
}

/// Worker lifecycle status, mirrored into the CRD `status.phase`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Initializing,
    Syncing,
    Synced,
    Failed,
}

impl WorkerStatus {
    pub fn phase(&self) -> &'static str {
        match self {
            WorkerStatus::Initializing => "Initializing",
            WorkerStatus::Syncing => "Syncing",
            WorkerStatus::Synced => "Synced",
            WorkerStatus::Failed => "Failed",
        }
    }
}

/// Snapshot of a repository's last sync, held in the cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncState {
    pub last_sync_ms: i64,
    pub last_commit: Option<String>,
    pub status: WorkerStatus,
}

/// Summary of one successful sync, returned to `sync_now` callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncSummary {
    pub commit: String,
    pub applied: usize,
    pub duration_ms: u64,
}

/// Map a repository name onto a filesystem-safe clone directory name.
/// Anything outside `[A-Za-z0-9_-]` becomes `-`.
pub fn sanitize_repo_dir(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '-' })
        .collect()
}

/// Current wall clock in unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Env helpers shared by the crates; knobs live under the `NOPEA_` prefix.
pub mod env {
    pub fn flag(name: &str, default: bool) -> bool {
        std::env::var(name)
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes"))
            .unwrap_or(default)
    }

    pub fn u64_var(name: &str, default: u64) -> u64 {
        std::env::var(name)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(default)
    }

    pub fn usize_var(name: &str, default: usize) -> usize {
        std::env::var(name)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(default)
    }
}
