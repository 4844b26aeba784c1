//! Counters and the optional `/health` + `/metrics` HTTP endpoint.

use crate::ack::{AckDecision, Outcome};
use crate::event::EventFamily;
use crate::shutdown::ShutdownSignal;
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Counters for one event family.
#[derive(Debug, Default)]
pub struct FamilyCounters {
    pub received: AtomicU64,
    pub acknowledged: AtomicU64,
    pub requeued: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub decode_failures: AtomicU64,
    pub execution_failures: AtomicU64,
}

impl FamilyCounters {
    fn to_json(&self) -> Value {
        json!({
            "received": self.received.load(Ordering::Relaxed),
            "acknowledged": self.acknowledged.load(Ordering::Relaxed),
            "requeued": self.requeued.load(Ordering::Relaxed),
            "dead_lettered": self.dead_lettered.load(Ordering::Relaxed),
            "decode_failures": self.decode_failures.load(Ordering::Relaxed),
            "execution_failures": self.execution_failures.load(Ordering::Relaxed),
        })
    }
}

/// Process-wide metrics.
#[derive(Debug)]
pub struct Metrics {
    client: FamilyCounters,
    admin: FamilyCounters,
    transport_ready: AtomicBool,
    start_time: Instant,
}

impl Metrics {
    /// Create counters with the transport marked not ready.
    pub fn new() -> Self {
        Self {
            client: FamilyCounters::default(),
            admin: FamilyCounters::default(),
            transport_ready: AtomicBool::new(false),
            start_time: Instant::now(),
        }
    }

    /// Counters for one event family.
    pub fn family(&self, family: EventFamily) -> &FamilyCounters {
        match family {
            EventFamily::Client => &self.client,
            EventFamily::Admin => &self.admin,
        }
    }

    /// Record a settled delivery.
    pub fn record(&self, family: EventFamily, outcome: &Outcome, decision: AckDecision) {
        let counters = self.family(family);
        counters.received.fetch_add(1, Ordering::Relaxed);

        match outcome {
            Outcome::DecodeFailed(_) => {
                counters.decode_failures.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::ExecutionFailed(_) => {
                counters.execution_failures.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }

        let counter = match decision {
            AckDecision::Acknowledge => &counters.acknowledged,
            AckDecision::RequeueAndRetry => &counters.requeued,
            AckDecision::DeadLetter => &counters.dead_lettered,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Called from the connection observer on every state change.
    pub fn set_transport_ready(&self, ready: bool) {
        self.transport_ready.store(ready, Ordering::Relaxed);
    }

    pub fn transport_ready(&self) -> bool {
        self.transport_ready.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// JSON body served at `/metrics`.
    pub fn snapshot(&self) -> Value {
        let uptime = self.uptime_seconds();

        let uptime_str = if uptime < 60 {
            format!("{}s", uptime)
        } else if uptime < 3600 {
            format!("{}m {}s", uptime / 60, uptime % 60)
        } else {
            format!("{}h {}m {}s", uptime / 3600, (uptime % 3600) / 60, uptime % 60)
        };

        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_seconds": uptime,
            "uptime": uptime_str,
            "transport_ready": self.transport_ready(),
            "events": {
                "client": self.client.to_json(),
                "admin": self.admin.to_json(),
            },
        })
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the `/health` and `/metrics` routes.
pub fn router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .with_state(metrics)
}

/// 200 while the queue connection is up, 503 otherwise.
async fn health_check(State(metrics): State<Arc<Metrics>>) -> (StatusCode, Json<Value>) {
    if metrics.transport_ready() {
        (StatusCode::OK, Json(json!({ "status": "ok", "rabbitmq": "connected" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "degraded", "rabbitmq": "disconnected" })),
        )
    }
}

async fn get_metrics(State(metrics): State<Arc<Metrics>>) -> Json<Value> {
    Json(metrics.snapshot())
}

/// Serve the health endpoint until shutdown.
pub async fn serve(port: u16, metrics: Arc<Metrics>, shutdown: ShutdownSignal) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Health endpoint listening");

    let mut receiver = shutdown.subscribe();
    axum::serve(listener, router(metrics))
        .with_graceful_shutdown(async move {
            let _ = receiver.recv().await;
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::DecodeError;
    use crate::executor::ExecutionResult;

    #[test]
    fn test_record_counts() {
        let metrics = Metrics::new();

        metrics.record(
            EventFamily::Client,
            &Outcome::Applied(ExecutionResult::success("t", Value::Null)),
            AckDecision::Acknowledge,
        );
        metrics.record(
            EventFamily::Client,
            &Outcome::DecodeFailed(DecodeError::ResourcePath(String::new())),
            AckDecision::RequeueAndRetry,
        );
        metrics.record(
            EventFamily::Admin,
            &Outcome::DecodeFailed(DecodeError::ResourcePath(String::new())),
            AckDecision::DeadLetter,
        );

        let client = metrics.family(EventFamily::Client);
        assert_eq!(client.received.load(Ordering::Relaxed), 2);
        assert_eq!(client.acknowledged.load(Ordering::Relaxed), 1);
        assert_eq!(client.requeued.load(Ordering::Relaxed), 1);
        assert_eq!(client.decode_failures.load(Ordering::Relaxed), 1);

        let admin = metrics.family(EventFamily::Admin);
        assert_eq!(admin.dead_lettered.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_snapshot() {
        let metrics = Metrics::new();
        metrics.set_transport_ready(true);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot["transport_ready"], true);
        assert_eq!(snapshot["events"]["client"]["received"], 0);
        assert!(snapshot["uptime"].as_str().unwrap().ends_with('s'));
    }

    #[tokio::test]
    async fn test_health_reflects_transport() {
        let metrics = Arc::new(Metrics::new());

        let (status, _) = health_check(State(metrics.clone())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        metrics.set_transport_ready(true);
        let (status, Json(body)) = health_check(State(metrics)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }
}
