//! Error taxonomy shared across the reconciliation core.
//!
//! Every error that can reach an event sink or a CRD condition is normalized
//! into one of the taxonomy kinds below; the wire shape is always
//! `{"type": "<kind>", "message": "<human readable>"}`.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NopeaError {
    /// Git subprocess failures: network, auth, missing refs.
    #[error("git: {0}")]
    Git(String),

    /// Manifest parsing failures: invalid YAML, missing key fields.
    #[error("parse: {0}")]
    Parse(String),

    /// Duplicate resource-key inside one repository tree.
    #[error("parse: duplicate resource key {0}")]
    DuplicateKey(String),

    /// Apply aborted mid-batch; `applied` documents had already succeeded.
    #[error("apply: applied {applied} manifest(s) then failed: {reason}")]
    PartialApply { applied: usize, reason: String },

    /// Other Kubernetes API failures (status patch, watch drop, discovery).
    #[error("k8s: {0}")]
    Kube(String),

    /// Webhook ingestion failures, surfaced only to the HTTP caller.
    #[error("webhook: {0}")]
    Webhook(String),

    /// Invalid runtime configuration.
    #[error("config: {0}")]
    Config(String),
}

impl NopeaError {
    /// Stable taxonomy name, used as the CRD condition reason and as the
    /// `error` label on metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            NopeaError::Git(_) => "git_error",
            NopeaError::Parse(_) | NopeaError::DuplicateKey(_) => "parse_error",
            NopeaError::PartialApply { .. } => "apply_error",
            NopeaError::Kube(_) => "k8s_error",
            NopeaError::Webhook(_) => "webhook_error",
            NopeaError::Config(_) => "config_error",
        }
    }

    /// Implementation-agnostic wire form carried inside failure events.
    pub fn to_wire(&self) -> ErrorWire {
        ErrorWire { r#type: self.kind(), message: self.to_string() }
    }
}

/// JSON shape of an error on the event wire.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorWire {
    pub r#type: &'static str,
    pub message: String,
}
