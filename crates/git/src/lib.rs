//! Git collaborator: clone/fetch, remote HEAD lookup, tree listing, blob reads.
//!
//! The reconciliation core talks to git through the [`GitOps`] trait; the
//! default implementation shells out to the `git` binary.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use metrics::histogram;
use nopea_core::NopeaError;
use tokio::process::Command;
use tracing::{debug, warn};

#[async_trait]
pub trait GitOps: Send + Sync {
    /// Clone or fast-forward `dest` to the tip of `branch` and return its sha.
    async fn sync(&self, url: &str, branch: &str, dest: &Path) -> Result<String, NopeaError>;

    /// Resolve the remote tip of `branch` without touching the clone.
    async fn remote_head(&self, url: &str, branch: &str) -> Result<String, NopeaError>;

    /// List YAML files under `subpath` of the clone, relative paths, sorted.
    async fn list_files(&self, dest: &Path, subpath: Option<&str>) -> Result<Vec<PathBuf>, NopeaError>;

    /// Read one file from the clone.
    async fn read_blob(&self, dest: &Path, rel: &Path) -> Result<Vec<u8>, NopeaError>;

    /// Sha of the clone's current HEAD.
    async fn head(&self, dest: &Path) -> Result<String, NopeaError>;
}

fn git_timeout() -> Duration {
    Duration::from_secs(nopea_core::env::u64_var("NOPEA_GIT_TIMEOUT_SECS", 120))
}

fn clone_depth() -> u64 {
    nopea_core::env::u64_var("NOPEA_GIT_DEPTH", 1)
}

/// Subprocess-backed implementation.
#[derive(Debug, Clone, Default)]
pub struct GitCli;

impl GitCli {
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, cwd: Option<&Path>, args: &[&str]) -> Result<String, NopeaError> {
        let mut cmd = Command::new("git");
        cmd.args(args).kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        debug!(?args, cwd = ?cwd, "git invocation");
        let out = tokio::time::timeout(git_timeout(), cmd.output())
            .await
            .map_err(|_| NopeaError::Git(format!("git {} timed out", args.first().unwrap_or(&""))))?
            .map_err(|e| NopeaError::Git(format!("spawning git: {}", e)))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(NopeaError::Git(format!(
                "git {} failed: {}",
                args.first().unwrap_or(&""),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    fn repo_label(dest: &Path) -> String {
        dest.file_name().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default()
    }
}

#[async_trait]
impl GitOps for GitCli {
    async fn sync(&self, url: &str, branch: &str, dest: &Path) -> Result<String, NopeaError> {
        let t0 = std::time::Instant::now();
        let depth = clone_depth();
        if dest.join(".git").is_dir() {
            let depth_arg;
            let mut args = vec!["fetch", "origin", branch];
            if depth > 0 {
                depth_arg = format!("--depth={}", depth);
                args.push(&depth_arg);
            }
            self.run(Some(dest), &args).await?;
            self.run(Some(dest), &["reset", "--hard", "FETCH_HEAD"]).await?;
            histogram!(
                "nopea_git_fetch_duration_seconds",
                t0.elapsed().as_secs_f64(),
                "repo" => Self::repo_label(dest)
            );
        } else {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| NopeaError::Git(format!("creating clone base dir: {}", e)))?;
            }
            let dest_s = dest.to_string_lossy().into_owned();
            let depth_arg;
            let mut args = vec!["clone", "--branch", branch, "--single-branch"];
            if depth > 0 {
                depth_arg = format!("--depth={}", depth);
                args.push(&depth_arg);
            }
            args.push(url);
            args.push(&dest_s);
            self.run(None, &args).await?;
            histogram!(
                "nopea_git_clone_duration_seconds",
                t0.elapsed().as_secs_f64(),
                "repo" => Self::repo_label(dest)
            );
        }
        self.head(dest).await
    }

    async fn remote_head(&self, url: &str, branch: &str) -> Result<String, NopeaError> {
        let refspec = format!("refs/heads/{}", branch);
        let out = self.run(None, &["ls-remote", url, &refspec]).await?;
        let sha = out.split_whitespace().next().unwrap_or("");
        if sha.is_empty() {
            return Err(NopeaError::Git(format!("ref not found: {} on {}", refspec, url)));
        }
        Ok(sha.to_string())
    }

    async fn list_files(&self, dest: &Path, subpath: Option<&str>) -> Result<Vec<PathBuf>, NopeaError> {
        let root = match subpath {
            Some(p) => dest.join(p),
            None => dest.to_path_buf(),
        };
        if !root.is_dir() {
            return Err(NopeaError::Git(format!("path not found in clone: {}", root.display())));
        }
        let mut out = Vec::new();
        let mut stack = vec![root.clone()];
        while let Some(dir) = stack.pop() {
            let entries = std::fs::read_dir(&dir)
                .map_err(|e| NopeaError::Git(format!("reading {}: {}", dir.display(), e)))?;
            for entry in entries {
                let entry = entry.map_err(|e| NopeaError::Git(e.to_string()))?;
                let path = entry.path();
                if path.is_dir() {
                    if entry.file_name() != ".git" {
                        stack.push(path);
                    }
                    continue;
                }
                match path.extension().and_then(|e| e.to_str()) {
                    Some("yaml") | Some("yml") => {
                        if let Ok(rel) = path.strip_prefix(dest) {
                            out.push(rel.to_path_buf());
                        }
                    }
                    _ => {}
                }
            }
        }
        out.sort();
        Ok(out)
    }

    async fn read_blob(&self, dest: &Path, rel: &Path) -> Result<Vec<u8>, NopeaError> {
        let path = dest.join(rel);
        tokio::fs::read(&path)
            .await
            .map_err(|e| NopeaError::Git(format!("reading {}: {}", path.display(), e)))
    }

    async fn head(&self, dest: &Path) -> Result<String, NopeaError> {
        let sha = self.run(Some(dest), &["rev-parse", "HEAD"]).await?;
        if sha.len() < 40 {
            warn!(sha = %sha, "unexpected rev-parse output");
        }
        Ok(sha)
    }
}
