//! Controller: watches `GitRepository` resources and reconciles the set of
//! running workers against the declared set.

#![forbid(unsafe_code)]

mod controller;
mod crd;

pub use controller::{leader_channel, Controller};
pub use crd::{parse_duration_ms, repo_spec_from, GitRepository, GitRepositorySpec, GitRepositoryStatus};
