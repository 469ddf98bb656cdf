//! `nopead`: the controller binary wiring cache, fleet, controller, webhook
//! endpoint, and event emitter together.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use nopea_cache::Cache;
use nopea_controller::{leader_channel, Controller};
use nopea_events::{spawn_emitter, EmitterConfig, EventFactory, IdGenerator, ReqwestPoster};
use nopea_git::GitCli;
use nopea_kube::KubeCluster;
use nopea_webhook::WebhookState;
use nopea_worker::{Fleet, WorkerDeps};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "nopead", version, about = "Nopea GitOps controller")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the reconciliation controller
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Namespace whose GitRepository resources are watched ("" = all)
    #[arg(long = "namespace", default_value = "")]
    namespace: String,

    /// Listen address for webhook, health, readiness, and metrics
    #[arg(long = "webhook-addr", default_value = "0.0.0.0:8080")]
    webhook_addr: SocketAddr,

    /// Base directory for repository clones
    #[arg(long = "repo-base", default_value = "/var/lib/nopea/repos")]
    repo_base: PathBuf,

    /// CloudEvents sink URL; omit to disable event emission
    #[arg(long = "events-endpoint")]
    events_endpoint: Option<String>,

    /// Stay passive until an external leader-election signal arrives
    #[arg(long = "leader-elect", action = ArgAction::SetTrue)]
    leader_elect: bool,
}

fn init_tracing() {
    let env = std::env::var("NOPEA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn init_metrics() -> Option<PrometheusHandle> {
    let builder = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("nopea_sync_duration_seconds".to_string()),
            &[0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0],
        )
        .ok()?;
    match builder.install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "failed to install metrics recorder");
            None
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let metrics = init_metrics();

    let cache = Arc::new(Cache::new());
    let ids = Arc::new(IdGenerator::new());
    let (emitter, emitter_task) = spawn_emitter(
        EmitterConfig { endpoint: args.events_endpoint.clone(), ..EmitterConfig::default() },
        Arc::new(ReqwestPoster::new()),
    );

    let deps = WorkerDeps {
        git: Arc::new(GitCli::new()),
        cluster: Arc::new(KubeCluster::new()),
        cache: cache.clone(),
        emitter: emitter.clone(),
        events: EventFactory::new(ids.clone()),
        repo_base: args.repo_base.clone(),
    };
    let fleet = Arc::new(Fleet::new(deps));
    let ready = Arc::new(AtomicBool::new(false));

    // With election disabled the process is leader for its lifetime; an
    // external elector drives the sender otherwise.
    let (leader_tx, leader_rx) = leader_channel(!args.leader_elect);
    if args.leader_elect {
        info!("leader election enabled; waiting for leadership signal");
    }

    let cancel = CancellationToken::new();
    let state = Arc::new(WebhookState {
        notifier: fleet.clone(),
        secret: std::env::var("NOPEA_WEBHOOK_SECRET").ok().filter(|s| !s.is_empty()),
        cache: cache.clone(),
        ids,
        controller_ready: ready.clone(),
        metrics,
    });
    let server = tokio::spawn(nopea_webhook::serve(args.webhook_addr, state.clone(), cancel.clone()));

    let controller = Controller::new(fleet.clone(), args.namespace.clone(), leader_rx, ready);
    let controller_task = tokio::spawn(controller.run(cancel.clone()));

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown signal received");
    cancel.cancel();

    // The controller stops every worker on its way out.
    match controller_task.await {
        Ok(Err(e)) => warn!(error = %e, "controller exited with error"),
        Err(e) => warn!(error = %e, "controller task join failed"),
        Ok(Ok(())) => {}
    }
    match server.await {
        Ok(Err(e)) => warn!(error = %e, "webhook server error"),
        Err(e) => warn!(error = %e, "webhook server join failed"),
        Ok(Ok(())) => {}
    }

    // Drop every producer so the emitter can drain its queue.
    drop(state);
    drop(fleet);
    drop(emitter);
    drop(leader_tx);
    if let Some(task) = emitter_task {
        task.wait().await;
    }
    info!("nopead stopped");
    Ok(())
}
