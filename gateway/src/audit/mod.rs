//! Routing decision audit trail.
//!
//! The request path hands decisions to a bounded channel and never waits on
//! the database. A background writer drains the channel into SQLite through
//! the `db` circuit breaker; while that breaker is open, decisions are skipped.

mod sqlite;

pub use sqlite::{AuditError, AuditStore, RouteStats};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::breaker::{BreakerError, CircuitBreaker};
use crate::classify::TaskType;

/// Route recorded when no local node could serve a request.
pub const FALLBACK_ROUTE: &str = "cloud";

/// One routing outcome, written once.
#[derive(Debug, Clone, Serialize)]
pub struct RoutingDecision {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub task_type: TaskType,
    pub prompt_length: usize,
    pub category: Option<String>,
    pub selected_route: String,
    pub latency_ms: Option<f64>,
    pub performance_score: Option<f64>,
    pub success: bool,
    /// Free-form details: model, node, attempt, or the failure reason.
    pub features: serde_json::Value,
}

impl RoutingDecision {
    pub fn new(
        task_type: TaskType,
        prompt_length: usize,
        category: Option<&str>,
        selected_route: impl Into<String>,
        success: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            task_type,
            prompt_length,
            category: category.map(String::from),
            selected_route: selected_route.into(),
            latency_ms: None,
            performance_score: None,
            success,
            features: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn with_latency(mut self, latency_ms: f64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    pub fn with_performance(mut self, score: f64) -> Self {
        self.performance_score = Some(score);
        self
    }

    pub fn with_features(mut self, features: serde_json::Value) -> Self {
        self.features = features;
        self
    }
}

/// Sending half of the audit channel. Cheap to clone.
#[derive(Debug, Clone)]
pub struct AuditSink {
    tx: Option<mpsc::Sender<RoutingDecision>>,
    dropped: Arc<AtomicU64>,
}

impl AuditSink {
    /// A sink that discards everything.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// A sink plus the receiving end, for callers that consume decisions themselves.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<RoutingDecision>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx: Some(tx),
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// A sink drained into `store` by a background writer.
    pub fn spawn(
        store: Arc<AuditStore>,
        breaker: Arc<CircuitBreaker>,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (sink, rx) = Self::channel(capacity);
        let handle = tokio::spawn(run_writer(rx, store, breaker));
        (sink, handle)
    }

    /// Queue a decision without waiting. A full channel drops it.
    pub fn record(&self, decision: RoutingDecision) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(decision) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(decision)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    route = %decision.selected_route,
                    "Audit channel full, routing decision dropped"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Audit writer stopped, routing decision dropped");
            }
        }
    }

    /// Decisions discarded because the channel was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Drain `rx` into `store` until every sender is gone.
pub async fn run_writer(
    mut rx: mpsc::Receiver<RoutingDecision>,
    store: Arc<AuditStore>,
    breaker: Arc<CircuitBreaker>,
) {
    while let Some(decision) = rx.recv().await {
        let store = store.clone();
        let result = breaker
            .call(|| async move {
                match tokio::task::spawn_blocking(move || store.insert(&decision)).await {
                    Ok(result) => result,
                    Err(e) => Err(AuditError::TaskFailed(e.to_string())),
                }
            })
            .await;

        match result {
            Ok(()) => {}
            Err(BreakerError::Open { remaining, .. }) => {
                tracing::debug!(
                    retry_in_secs = remaining.as_secs(),
                    "Audit database circuit open, decision skipped"
                );
            }
            Err(BreakerError::Inner(e)) => {
                tracing::warn!(error = %e, "Failed to write routing decision");
            }
        }
    }
    tracing::debug!("Audit writer stopped");
}
