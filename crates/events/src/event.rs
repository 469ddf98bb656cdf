//! CDEvents payloads wrapped in a CloudEvents envelope.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use nopea_core::error::ErrorWire;
use serde::Serialize;
use serde_json::Value as Json;

use crate::id::IdGenerator;

pub const TYPE_SERVICE_DEPLOYED: &str = "dev.cdevents.service.deployed.0.3.0";
pub const TYPE_SERVICE_UPGRADED: &str = "dev.cdevents.service.upgraded.0.3.0";
pub const TYPE_SERVICE_REMOVED: &str = "dev.cdevents.service.removed.0.3.0";
pub const TYPE_ENV_CREATED: &str = "dev.cdevents.environment.created.0.3.0";
pub const TYPE_ENV_MODIFIED: &str = "dev.cdevents.environment.modified.0.3.0";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Environment {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SubjectContent {
    pub environment: Environment,
    #[serde(rename = "artifactId")]
    pub artifact_id: String,
    #[serde(flatten)]
    pub custom: serde_json::Map<String, Json>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Subject {
    pub id: String,
    pub content: SubjectContent,
}

/// One lifecycle event. `id` is a monotonic ULID; `source` identifies the
/// emitting worker.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CdEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub source: String,
    pub specversion: String,
    pub timestamp: DateTime<Utc>,
    pub subject: Subject,
}

impl CdEvent {
    /// CloudEvents 1.0 envelope with the CDEvent as `data`.
    pub fn to_cloudevents(&self) -> Json {
        serde_json::json!({
            "specversion": "1.0",
            "id": self.id,
            "source": self.source,
            "type": self.ty,
            "time": self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            "datacontenttype": "application/json",
            "data": serde_json::to_value(self).expect("event serializes"),
        })
    }
}

/// Builds events for one controller instance; shared across workers.
#[derive(Clone)]
pub struct EventFactory {
    ids: Arc<IdGenerator>,
}

impl EventFactory {
    pub fn new(ids: Arc<IdGenerator>) -> Self {
        Self { ids }
    }

    fn base(&self, ty: &str, repo: &str, environment_id: &str, commit: &str) -> CdEvent {
        CdEvent {
            id: self.ids.next(),
            ty: ty.to_string(),
            source: format!("/nopea/worker/{}", repo),
            specversion: "1.0".to_string(),
            timestamp: Utc::now(),
            subject: Subject {
                id: repo.to_string(),
                content: SubjectContent {
                    environment: Environment { id: environment_id.to_string(), source: None },
                    artifact_id: format!("pkg:git/{}@{}", repo, commit),
                    custom: serde_json::Map::new(),
                },
            },
        }
    }

    /// First successful sync of a repository.
    pub fn service_deployed(
        &self,
        repo: &str,
        environment_id: &str,
        commit: &str,
        manifests: usize,
        duration_ms: u64,
    ) -> CdEvent {
        let mut ev = self.base(TYPE_SERVICE_DEPLOYED, repo, environment_id, commit);
        let custom = &mut ev.subject.content.custom;
        custom.insert("commit".into(), Json::String(commit.to_string()));
        custom.insert("manifests".into(), Json::from(manifests));
        custom.insert("durationMs".into(), Json::from(duration_ms));
        ev
    }

    /// Subsequent successful sync.
    #[allow(clippy::too_many_arguments)]
    pub fn service_upgraded(
        &self,
        repo: &str,
        environment_id: &str,
        commit: &str,
        previous_commit: Option<&str>,
        manifests: usize,
        duration_ms: u64,
    ) -> CdEvent {
        let mut ev = self.base(TYPE_SERVICE_UPGRADED, repo, environment_id, commit);
        let custom = &mut ev.subject.content.custom;
        custom.insert("commit".into(), Json::String(commit.to_string()));
        if let Some(prev) = previous_commit {
            custom.insert("previousCommit".into(), Json::String(prev.to_string()));
        }
        custom.insert("manifests".into(), Json::from(manifests));
        custom.insert("durationMs".into(), Json::from(duration_ms));
        ev
    }

    /// Sync failure, carried as `service.removed` with a failure outcome and
    /// the normalized error shape.
    pub fn sync_failed(
        &self,
        repo: &str,
        environment_id: &str,
        commit: Option<&str>,
        error: &ErrorWire,
    ) -> CdEvent {
        let mut ev = self.base(TYPE_SERVICE_REMOVED, repo, environment_id, commit.unwrap_or("unknown"));
        let custom = &mut ev.subject.content.custom;
        custom.insert("outcome".into(), Json::String("failure".to_string()));
        custom.insert("error".into(), serde_json::to_value(error).expect("error wire serializes"));
        ev
    }
}
