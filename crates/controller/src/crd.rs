//! The `GitRepository` custom resource and its translation into a worker
//! configuration.

use kube::CustomResource;
use nopea_core::{HealPolicy, RepoSpec, DEFAULT_POLL_INTERVAL_MS};
use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, Default)]
#[kube(
    group = "nopea.io",
    version = "v1alpha1",
    kind = "GitRepository",
    plural = "gitrepositories",
    shortname = "gitrepo",
    namespaced,
    status = "GitRepositoryStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct GitRepositorySpec {
    /// Clone URL; the only required field.
    pub url: String,
    pub branch: Option<String>,
    /// Subpath within the repository to reconcile.
    pub path: Option<String>,
    pub target_namespace: Option<String>,
    /// Poll interval as a duration string, e.g. "30s", "5m", "1h".
    pub interval: Option<String>,
    pub heal_policy: Option<String>,
    pub heal_grace_period: Option<String>,
    pub suspend: Option<bool>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct GitRepositoryStatus {
    pub phase: Option<String>,
    pub last_applied_commit: Option<String>,
    pub last_sync_time: Option<String>,
    pub observed_generation: Option<i64>,
    pub conditions: Option<Vec<RepoCondition>>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RepoCondition {
    pub r#type: String,
    pub status: String,
    pub last_transition_time: Option<String>,
    pub reason: Option<String>,
    pub message: Option<String>,
}

static DURATION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)(s|m|h)$").expect("valid regex"));

/// Parse a duration string of the form `<n>(s|m|h)` into milliseconds.
pub fn parse_duration_ms(s: &str) -> Option<u64> {
    let caps = DURATION_RE.captures(s)?;
    let n: u64 = caps[1].parse().ok()?;
    let unit_ms = match &caps[2] {
        "s" => 1_000,
        "m" => 60_000,
        _ => 3_600_000,
    };
    n.checked_mul(unit_ms)
}

/// Translate a cluster resource into a worker configuration. Returns `None`
/// when the resource is unusable (no name).
pub fn repo_spec_from(cr: &GitRepository) -> Option<RepoSpec> {
    let name = cr.metadata.name.clone()?;
    let namespace = cr.metadata.namespace.clone().unwrap_or_else(|| "default".to_string());
    let spec = &cr.spec;

    let poll_interval_ms = match spec.interval.as_deref() {
        None => DEFAULT_POLL_INTERVAL_MS,
        Some(s) => parse_duration_ms(s).unwrap_or_else(|| {
            warn!(repo = %name, interval = %s, "unparseable interval; using default");
            DEFAULT_POLL_INTERVAL_MS
        }),
    };
    let heal_grace_period_ms = spec.heal_grace_period.as_deref().and_then(|s| {
        let parsed = parse_duration_ms(s);
        if parsed.is_none() {
            warn!(repo = %name, grace = %s, "unparseable heal grace period; ignoring");
        }
        parsed
    });

    Some(RepoSpec {
        target_namespace: spec.target_namespace.clone().unwrap_or_else(|| namespace.clone()),
        branch: spec.branch.clone().unwrap_or_else(|| "main".to_string()),
        subpath: spec.path.clone(),
        url: spec.url.clone(),
        poll_interval_ms,
        heal_policy: spec.heal_policy.as_deref().map(HealPolicy::parse).unwrap_or_default(),
        heal_grace_period_ms,
        suspend: spec.suspend.unwrap_or(false),
        generation: cr.metadata.generation,
        name,
        namespace,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_grammar() {
        assert_eq!(parse_duration_ms("30s"), Some(30_000));
        assert_eq!(parse_duration_ms("5m"), Some(300_000));
        assert_eq!(parse_duration_ms("1h"), Some(3_600_000));
        assert_eq!(parse_duration_ms("5"), None);
        assert_eq!(parse_duration_ms("5d"), None);
        assert_eq!(parse_duration_ms("m5"), None);
        assert_eq!(parse_duration_ms(""), None);
    }

    fn fixture(spec_yaml: &str) -> GitRepository {
        let spec: GitRepositorySpec = serde_yaml::from_str(spec_yaml).unwrap();
        let mut cr = GitRepository::new("my-app", spec);
        cr.metadata.namespace = Some("team-a".to_string());
        cr.metadata.generation = Some(4);
        cr
    }

    #[test]
    fn five_minute_interval_doubles_for_reconcile() {
        let cr = fixture("url: https://example.com/app.git\ninterval: 5m\n");
        let spec = repo_spec_from(&cr).unwrap();
        assert_eq!(spec.poll_interval_ms, 300_000);
        assert_eq!(spec.reconcile_interval_ms(), 600_000);
    }

    #[test]
    fn defaults_fill_the_blanks() {
        let cr = fixture("url: https://example.com/app.git\n");
        let spec = repo_spec_from(&cr).unwrap();
        assert_eq!(spec.branch, "main");
        assert_eq!(spec.target_namespace, "team-a");
        assert_eq!(spec.poll_interval_ms, 300_000);
        assert_eq!(spec.heal_policy, HealPolicy::Auto);
        assert_eq!(spec.heal_grace_period_ms, None);
        assert!(!spec.suspend);
        assert_eq!(spec.generation, Some(4));
    }

    #[test]
    fn bad_interval_falls_back_to_default() {
        let cr = fixture("url: https://example.com/app.git\ninterval: sometimes\n");
        assert_eq!(repo_spec_from(&cr).unwrap().poll_interval_ms, 300_000);
    }

    #[test]
    fn camel_case_fields_deserialize() {
        let cr = fixture(
            "url: https://example.com/app.git\nbranch: develop\npath: deploy\ntargetNamespace: prod\nhealPolicy: manual\nhealGracePeriod: 2m\nsuspend: true\n",
        );
        let spec = repo_spec_from(&cr).unwrap();
        assert_eq!(spec.branch, "develop");
        assert_eq!(spec.subpath.as_deref(), Some("deploy"));
        assert_eq!(spec.target_namespace, "prod");
        assert_eq!(spec.heal_policy, HealPolicy::Manual);
        assert_eq!(spec.heal_grace_period_ms, Some(120_000));
        assert!(spec.suspend);
    }
}
