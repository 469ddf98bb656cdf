//! Per-repository workers and the fleet supervisor that owns them.

#![forbid(unsafe_code)]

mod fleet;
mod worker;

pub use fleet::{Fleet, FleetError};
pub use worker::{Worker, WorkerDeps, WorkerMsg};

/// Timeout for blocking `sync_now` calls.
pub const SYNC_NOW_TIMEOUT_SECS: u64 = 300;
