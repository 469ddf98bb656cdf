//! Provider detection, signature verification, and push-payload parsing
//! for GitHub and GitLab webhooks.

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::WebhookError;

const GITHUB_EVENT_HEADER: &str = "x-github-event";
const GITLAB_EVENT_HEADER: &str = "x-gitlab-event";
const GITHUB_SIGNATURE_HEADER: &str = "x-hub-signature-256";
const GITLAB_TOKEN_HEADER: &str = "x-gitlab-token";

static REPO_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9._-]{1,253}$").expect("valid regex"));
static COMMIT_SHA_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9a-f]{40}|[0-9a-f]{64})$").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Github,
    Gitlab,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Github => "github",
            Provider::Gitlab => "gitlab",
        }
    }
}

/// Parsed push notification, provider-agnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushEvent {
    pub repo_full_name: String,
    pub branch: String,
    pub commit: String,
}

pub fn valid_repo_name(name: &str) -> bool {
    REPO_NAME_RE.is_match(name)
}

pub fn detect_provider(headers: &HeaderMap) -> Result<Provider, WebhookError> {
    if headers.contains_key(GITHUB_EVENT_HEADER) {
        Ok(Provider::Github)
    } else if headers.contains_key(GITLAB_EVENT_HEADER) {
        Ok(Provider::Gitlab)
    } else {
        Err(WebhookError::UnknownProvider)
    }
}

/// Verify the request against the shared secret. Both providers compare in
/// constant time; an empty secret refuses verification outright.
pub fn verify_signature(
    provider: Provider,
    headers: &HeaderMap,
    body: &[u8],
    secret: Option<&str>,
) -> Result<(), WebhookError> {
    let secret = match secret {
        Some(s) if !s.is_empty() => s,
        _ => return Err(WebhookError::NotConfigured),
    };
    match provider {
        Provider::Github => {
            let header = headers
                .get(GITHUB_SIGNATURE_HEADER)
                .ok_or(WebhookError::MissingSignature)?
                .to_str()
                .map_err(|_| WebhookError::InvalidSignature)?;
            let hex_sig = header.strip_prefix("sha256=").ok_or(WebhookError::InvalidSignature)?;
            let sig = hex::decode(hex_sig).map_err(|_| WebhookError::InvalidSignature)?;
            let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
                .map_err(|_| WebhookError::InvalidSignature)?;
            mac.update(body);
            mac.verify_slice(&sig).map_err(|_| WebhookError::InvalidSignature)
        }
        Provider::Gitlab => {
            let token = headers
                .get(GITLAB_TOKEN_HEADER)
                .ok_or(WebhookError::MissingSignature)?
                .to_str()
                .map_err(|_| WebhookError::InvalidSignature)?;
            if token.as_bytes().ct_eq(secret.as_bytes()).into() {
                Ok(())
            } else {
                Err(WebhookError::InvalidSignature)
            }
        }
    }
}

#[derive(Deserialize)]
struct GithubRepo {
    full_name: String,
}

#[derive(Deserialize)]
struct GithubPush {
    #[serde(rename = "ref")]
    git_ref: String,
    after: String,
    repository: Option<GithubRepo>,
}

#[derive(Deserialize)]
struct GitlabProject {
    path_with_namespace: String,
}

#[derive(Deserialize)]
struct GitlabPush {
    object_kind: String,
    #[serde(rename = "ref")]
    git_ref: String,
    after: String,
    project: Option<GitlabProject>,
}

/// Parse a push payload. Only push events for branch refs are accepted;
/// GitHub ping events surface as `Ok(None)` so the caller can 200 them.
pub fn parse_push(
    provider: Provider,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Option<PushEvent>, WebhookError> {
    match provider {
        Provider::Github => {
            let event = headers
                .get(GITHUB_EVENT_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if event == "ping" {
                return Ok(None);
            }
            if event != "push" {
                return Err(WebhookError::UnsupportedEvent(event.to_string()));
            }
            let payload: GithubPush = serde_json::from_slice(body)
                .map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;
            let branch = branch_from_ref(&payload.git_ref)?;
            let commit = valid_commit(&payload.after)?;
            Ok(Some(PushEvent {
                repo_full_name: payload.repository.map(|r| r.full_name).unwrap_or_default(),
                branch,
                commit,
            }))
        }
        Provider::Gitlab => {
            let payload: GitlabPush = serde_json::from_slice(body)
                .map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;
            if payload.object_kind != "push" {
                return Err(WebhookError::UnsupportedEvent(payload.object_kind));
            }
            let branch = branch_from_ref(&payload.git_ref)?;
            let commit = valid_commit(&payload.after)?;
            Ok(Some(PushEvent {
                repo_full_name: payload.project.map(|p| p.path_with_namespace).unwrap_or_default(),
                branch,
                commit,
            }))
        }
    }
}

fn branch_from_ref(git_ref: &str) -> Result<String, WebhookError> {
    git_ref
        .strip_prefix("refs/heads/")
        .map(|b| b.to_string())
        .ok_or_else(|| WebhookError::UnsupportedEvent(format!("non-branch ref {}", git_ref)))
}

fn valid_commit(sha: &str) -> Result<String, WebhookError> {
    if COMMIT_SHA_RE.is_match(sha) {
        Ok(sha.to_string())
    } else {
        Err(WebhookError::InvalidCommitSha)
    }
}
