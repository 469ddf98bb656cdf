//! Webhook ingestion endpoint plus health/readiness/metrics probes.

#![forbid(unsafe_code)]

mod error;
mod provider;

pub use error::WebhookError;
pub use provider::{detect_provider, parse_push, valid_repo_name, verify_signature, Provider, PushEvent};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use nopea_cache::Cache;
use nopea_events::IdGenerator;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Seam between the HTTP layer and the fleet so the endpoint can be tested
/// without real workers.
#[async_trait]
pub trait WorkerNotifier: Send + Sync {
    /// Best-effort dispatch; returns whether a worker was found.
    async fn notify(&self, repo: &str, commit: &str) -> bool;
}

#[async_trait]
impl WorkerNotifier for nopea_worker::Fleet {
    async fn notify(&self, repo: &str, commit: &str) -> bool {
        self.notify_webhook(repo, commit).await
    }
}

pub struct WebhookState {
    pub notifier: Arc<dyn WorkerNotifier>,
    pub secret: Option<String>,
    pub cache: Arc<Cache>,
    pub ids: Arc<IdGenerator>,
    pub controller_ready: Arc<AtomicBool>,
    pub metrics: Option<PrometheusHandle>,
}

pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/webhook/:repo", post(webhook))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics_text))
        .fallback(|| async { StatusCode::NOT_FOUND })
        .with_state(state)
}

/// Bind and serve until cancelled.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<WebhookState>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "webhook endpoint listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

async fn webhook(
    State(state): State<Arc<WebhookState>>,
    Path(repo): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, WebhookError> {
    if !valid_repo_name(&repo) {
        return Err(WebhookError::InvalidRepoName);
    }
    let provider = detect_provider(&headers)?;
    verify_signature(provider, &headers, &body, state.secret.as_deref())?;
    let Some(push) = parse_push(provider, &headers, &body)? else {
        // Provider liveness checks (e.g. GitHub ping) are fine but carry
        // nothing to act on.
        return Ok(Json(serde_json::json!({ "status": "ignored" })));
    };

    // The response never waits for the sync; the send is fire-and-forget.
    let notified = state.notifier.notify(&repo, &push.commit).await;
    let result = if notified { "accepted" } else { "ignored" };
    counter!("nopea_webhook_requests_total", 1u64,
        "provider" => provider.as_str(), "result" => result);
    info!(
        repo = %repo,
        provider = provider.as_str(),
        source_repo = %push.repo_full_name,
        branch = %push.branch,
        commit = %push.commit,
        notified,
        "webhook processed"
    );
    Ok(Json(serde_json::json!({ "status": result })))
}

async fn health(State(state): State<Arc<WebhookState>>) -> Response {
    let cache_ok = state.cache.available();
    let ulid_ok = state.ids.alive();
    let healthy = cache_ok && ulid_ok;
    let body = serde_json::json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "checks": { "cache": cache_ok, "ulid": ulid_ok },
    });
    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(body)).into_response()
}

async fn ready(State(state): State<Arc<WebhookState>>) -> Response {
    if state.controller_ready.load(Ordering::SeqCst) {
        (StatusCode::OK, Json(serde_json::json!({ "status": "ready" }))).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(serde_json::json!({ "status": "not_ready" }))).into_response()
    }
}

async fn metrics_text(State(state): State<Arc<WebhookState>>) -> Response {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}
