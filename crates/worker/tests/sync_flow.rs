//! Startup, webhook, and failure paths of the worker state machine.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::*;
use nopea_core::WorkerStatus;
use nopea_events::{TYPE_SERVICE_DEPLOYED, TYPE_SERVICE_REMOVED, TYPE_SERVICE_UPGRADED};
use nopea_worker::WorkerMsg;
use tokio::sync::oneshot;

const COMMIT_A: &str = "abc123abc123abc123abc123abc123abc123abc1";
const COMMIT_B: &str = "def456def456def456def456def456def456def4";

#[tokio::test]
async fn startup_sync_applies_everything_and_emits_deployed() {
    let git = Arc::new(FakeGit::new(COMMIT_A, vec![("app.yaml", THREE_DOCS)]));
    let rig = spawn_rig(repo_spec("my-app"), git);

    wait_until("3 applies", || rig.cluster.apply_count() == 3).await;
    wait_until("cached commit", || rig.cache.get_commit("my-app").as_deref() == Some(COMMIT_A)).await;

    // The cached sync state mirrors the worker's commit.
    let state = rig.cache.get_sync_state("my-app").unwrap();
    assert_eq!(state.last_commit.as_deref(), Some(COMMIT_A));
    assert_eq!(state.status, WorkerStatus::Synced);

    // Last-applied records the normalized manifests, keyed per resource.
    let applied = rig.cache.list_last_applied("my-app");
    assert_eq!(applied.len(), 3);
    assert!(applied.iter().any(|(k, _)| k == "v1/ConfigMap/prod/api-config"));

    // CRD went through Syncing into Synced with the apply count
    wait_until("status patches", || rig.cluster.phases().contains(&"Synced".to_string())).await;
    let statuses = rig.cluster.statuses.lock().unwrap();
    let synced = statuses.iter().find(|s| s["phase"] == "Synced").unwrap();
    assert_eq!(synced["lastAppliedCommit"], COMMIT_A);
    assert_eq!(synced["conditions"][0]["type"], "Ready");
    assert_eq!(synced["conditions"][0]["status"], "True");
    assert_eq!(synced["conditions"][0]["message"], "Applied 3 manifests");
    drop(statuses);

    wait_until("deployed event", || rig.poster.find_event(TYPE_SERVICE_DEPLOYED).is_some()).await;
    let ev = rig.poster.find_event(TYPE_SERVICE_DEPLOYED).unwrap();
    assert_eq!(ev["source"], "/nopea/worker/my-app");
    assert_eq!(
        ev["data"]["subject"]["content"]["artifactId"],
        format!("pkg:git/my-app@{}", COMMIT_A)
    );
    assert_eq!(ev["data"]["subject"]["content"]["environment"]["id"], "prod");

    rig.cancel.cancel();
}

#[tokio::test]
async fn webhook_triggers_sync_and_emits_upgraded_with_previous_commit() {
    let git = Arc::new(FakeGit::new(COMMIT_A, vec![("app.yaml", THREE_DOCS)]));
    let rig = spawn_rig(repo_spec("my-app"), git);
    wait_until("startup sync", || rig.cluster.apply_count() == 3).await;

    rig.git.set_head(COMMIT_B);
    rig.git.set_file(
        "app.yaml",
        &THREE_DOCS.replace("LOG_LEVEL: info", "LOG_LEVEL: info\n  TIMEOUT: \"60\""),
    );
    rig.tx.send(WorkerMsg::Webhook { commit: COMMIT_B.to_string() }).await.unwrap();

    wait_until("second sync", || rig.cluster.apply_count() == 6).await;
    let live = rig.cluster.live("v1/ConfigMap/prod/api-config").unwrap();
    assert_eq!(live["data"]["TIMEOUT"], "60");

    wait_until("upgraded event", || rig.poster.find_event(TYPE_SERVICE_UPGRADED).is_some()).await;
    let ev = rig.poster.find_event(TYPE_SERVICE_UPGRADED).unwrap();
    assert_eq!(ev["data"]["subject"]["content"]["previousCommit"], COMMIT_A);
    assert_eq!(
        ev["data"]["subject"]["content"]["artifactId"],
        format!("pkg:git/my-app@{}", COMMIT_B)
    );

    assert_eq!(rig.cache.get_commit("my-app").as_deref(), Some(COMMIT_B));
    rig.cancel.cancel();
}

#[tokio::test]
async fn git_failure_reports_failed_and_recovers_on_next_trigger() {
    let git = Arc::new(FakeGit::new(COMMIT_A, vec![("app.yaml", THREE_DOCS)]));
    git.fail.store(true, Ordering::Relaxed);
    let rig = spawn_rig(repo_spec("my-app"), git);

    wait_until("failed phase", || rig.cluster.phases().contains(&"Failed".to_string())).await;
    {
        let statuses = rig.cluster.statuses.lock().unwrap();
        let failed = statuses.iter().find(|s| s["phase"] == "Failed").unwrap();
        assert_eq!(failed["conditions"][0]["type"], "Ready");
        assert_eq!(failed["conditions"][0]["status"], "False");
        assert_eq!(failed["conditions"][0]["reason"], "git_error");
    }
    assert_eq!(rig.cluster.apply_count(), 0);
    assert_eq!(rig.cache.get_commit("my-app"), None);

    wait_until("failure event", || rig.poster.find_event(TYPE_SERVICE_REMOVED).is_some()).await;
    let ev = rig.poster.find_event(TYPE_SERVICE_REMOVED).unwrap();
    assert_eq!(ev["data"]["subject"]["content"]["outcome"], "failure");
    assert_eq!(ev["data"]["subject"]["content"]["error"]["type"], "git_error");

    // The worker did not crash; the next trigger recovers.
    rig.git.fail.store(false, Ordering::Relaxed);
    let (reply, rx) = oneshot::channel();
    rig.tx.send(WorkerMsg::SyncNow { reply }).await.unwrap();
    let summary = rx.await.unwrap().unwrap();
    assert_eq!(summary.commit, COMMIT_A);
    assert_eq!(summary.applied, 3);
    // First successful sync after the failure is still "deployed".
    wait_until("deployed event", || rig.poster.find_event(TYPE_SERVICE_DEPLOYED).is_some()).await;
    rig.cancel.cancel();
}

#[tokio::test]
async fn parse_failure_fails_the_whole_sync() {
    let git = Arc::new(FakeGit::new(
        COMMIT_A,
        vec![("good.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: ok\n"), ("bad.yaml", "kind: Oops\n")],
    ));
    let rig = spawn_rig(repo_spec("my-app"), git);

    wait_until("failed phase", || rig.cluster.phases().contains(&"Failed".to_string())).await;
    let statuses = rig.cluster.statuses.lock().unwrap();
    let failed = statuses.iter().find(|s| s["phase"] == "Failed").unwrap();
    assert_eq!(failed["conditions"][0]["reason"], "parse_error");
    drop(statuses);
    assert_eq!(rig.cluster.apply_count(), 0, "no partial tree may be applied");
    rig.cancel.cancel();
}

#[tokio::test]
async fn suspended_worker_ignores_every_trigger() {
    let git = Arc::new(FakeGit::new(COMMIT_A, vec![("app.yaml", THREE_DOCS)]));
    let mut spec = repo_spec("my-app");
    spec.suspend = true;
    let rig = spawn_rig(spec, git);

    rig.tx.send(WorkerMsg::Webhook { commit: COMMIT_B.to_string() }).await.unwrap();
    rig.tx.send(WorkerMsg::Reconcile).await.unwrap();
    let (reply, rx) = oneshot::channel();
    rig.tx.send(WorkerMsg::SyncNow { reply }).await.unwrap();
    let result = rx.await.unwrap();
    assert!(result.is_err(), "sync_now on a suspended repo reports an error");
    assert_eq!(rig.cluster.apply_count(), 0);
    assert!(rig.poster.event_types().is_empty());
    rig.cancel.cancel();
}
