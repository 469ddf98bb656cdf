//! Bounded asynchronous event queue with exponential-backoff delivery.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::event::CdEvent;

const CONTENT_TYPE: &str = "application/cloudevents+json";

/// HTTP seam; injected so tests can script responses.
#[async_trait]
pub trait HttpPoster: Send + Sync {
    /// POST `body` and return the response status code.
    async fn post(&self, url: &str, content_type: &str, body: String) -> Result<u16, String>;
}

pub struct ReqwestPoster {
    client: reqwest::Client,
}

impl Default for ReqwestPoster {
    fn default() -> Self {
        Self::new()
    }
}

impl ReqwestPoster {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

#[async_trait]
impl HttpPoster for ReqwestPoster {
    async fn post(&self, url: &str, content_type: &str, body: String) -> Result<u16, String> {
        let resp = self
            .client
            .post(url)
            .header("content-type", content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        Ok(resp.status().as_u16())
    }
}

#[derive(Debug, Clone)]
pub struct EmitterConfig {
    /// Sink URL; `None` disables the emitter entirely.
    pub endpoint: Option<String>,
    pub retry_delay_ms: u64,
    pub max_retries: u32,
    pub queue_cap: usize,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            retry_delay_ms: nopea_core::env::u64_var("NOPEA_EVENTS_RETRY_DELAY_MS", 1000),
            max_retries: nopea_core::env::u64_var("NOPEA_EVENTS_MAX_RETRIES", 3) as u32,
            queue_cap: nopea_core::env::usize_var("NOPEA_EVENTS_QUEUE_CAP", 256),
        }
    }
}

#[derive(Default)]
struct EmitterStats {
    sent: AtomicU64,
    dropped: AtomicU64,
}

/// Cheap-to-clone producer half. `emit` never blocks and never fails.
#[derive(Clone)]
pub struct EventEmitter {
    tx: Option<mpsc::Sender<CdEvent>>,
    stats: Arc<EmitterStats>,
}

impl EventEmitter {
    /// An emitter with no sink: every event is silently dropped.
    pub fn disabled() -> Self {
        Self { tx: None, stats: Arc::new(EmitterStats::default()) }
    }

    pub fn emit(&self, event: CdEvent) {
        let Some(tx) = &self.tx else {
            debug!(ty = %event.ty, "emitter disabled; event dropped");
            return;
        };
        if tx.try_send(event).is_err() {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            counter!("nopea_events_dropped_total", 1u64);
            warn!("event queue full; event dropped");
        }
    }

    pub fn sent_count(&self) -> u64 {
        self.stats.sent.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }

    /// Counters that stay readable after the producer half is dropped.
    pub fn counters(&self) -> EmitterCounters {
        EmitterCounters { stats: Arc::clone(&self.stats) }
    }
}

#[derive(Clone)]
pub struct EmitterCounters {
    stats: Arc<EmitterStats>,
}

impl EmitterCounters {
    pub fn sent(&self) -> u64 {
        self.stats.sent.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }
}

/// Consumer-half handle; await it after the last producer clone is dropped
/// to drain the queue.
pub struct EmitterTask {
    join: JoinHandle<()>,
}

impl EmitterTask {
    pub async fn wait(self) {
        let _ = self.join.await;
    }
}

/// Spawn the single-consumer delivery loop.
pub fn spawn_emitter(cfg: EmitterConfig, poster: Arc<dyn HttpPoster>) -> (EventEmitter, Option<EmitterTask>) {
    let Some(endpoint) = cfg.endpoint.clone() else {
        return (EventEmitter::disabled(), None);
    };
    let (tx, mut rx) = mpsc::channel::<CdEvent>(cfg.queue_cap.max(1));
    let stats = Arc::new(EmitterStats::default());
    let stats_task = Arc::clone(&stats);

    let join = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let body = match serde_json::to_string(&event.to_cloudevents()) {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, "event serialization failed; dropped");
                    stats_task.dropped.fetch_add(1, Ordering::Relaxed);
                    counter!("nopea_events_dropped_total", 1u64);
                    continue;
                }
            };
            let mut delivered = false;
            for attempt in 1..=cfg.max_retries.max(1) {
                match poster.post(&endpoint, CONTENT_TYPE, body.clone()).await {
                    Ok(code) if (200..300).contains(&code) => {
                        delivered = true;
                        break;
                    }
                    Ok(code) => {
                        warn!(code, attempt, ty = %event.ty, "event sink rejected delivery");
                    }
                    Err(e) => {
                        warn!(error = %e, attempt, ty = %event.ty, "event delivery failed");
                    }
                }
                if attempt < cfg.max_retries.max(1) {
                    let backoff = cfg.retry_delay_ms.saturating_mul(1u64 << (attempt - 1));
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
            }
            if delivered {
                stats_task.sent.fetch_add(1, Ordering::Relaxed);
                counter!("nopea_events_sent_total", 1u64);
            } else {
                stats_task.dropped.fetch_add(1, Ordering::Relaxed);
                counter!("nopea_events_dropped_total", 1u64);
            }
        }
        info!("event emitter drained");
    });

    (EventEmitter { tx: Some(tx), stats }, Some(EmitterTask { join }))
}
