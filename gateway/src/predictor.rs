//! Learned route prediction and the A/B switch that decides when to use it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use rand::Rng;
use tokio::sync::watch;
use tokio::time::{Duration, MissedTickBehavior};

use crate::audit::{AuditError, AuditStore, RouteStats, FALLBACK_ROUTE};
use crate::breaker::{BreakerError, CircuitBreaker};
use crate::classify::TaskType;

/// Pseudo-observations added to every route's sample count, so routes with
/// little history cannot reach a high confidence.
const PRIOR_SAMPLES: f64 = 5.0;

/// A proposed route and how sure the predictor is of it (0..=1).
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub route: String,
    pub confidence: f64,
}

/// Proposes a route for a request.
pub trait RoutePredictor: Send + Sync {
    /// Pick one of `candidates` (routing keys), or `None` without an opinion.
    fn predict(&self, task_type: TaskType, prompt_length: usize, candidates: &[&str]) -> Option<Prediction>;
}

/// Predicts from per-task-type route success rates in the audit history.
///
/// The table is refreshed in the background; `predict` only reads memory.
pub struct HistoryPredictor {
    window: chrono::Duration,
    table: RwLock<HashMap<TaskType, Vec<RouteStats>>>,
}

impl HistoryPredictor {
    /// `window` bounds how far back decisions are considered.
    pub fn new(window: chrono::Duration) -> Self {
        Self {
            window,
            table: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the table. Rows with unknown task types are ignored.
    pub fn load(&self, stats: Vec<RouteStats>) {
        let mut table: HashMap<TaskType, Vec<RouteStats>> = HashMap::new();
        for row in stats {
            if row.route == FALLBACK_ROUTE {
                continue;
            }
            if let Some(task) = TaskType::parse(&row.task_type) {
                table.entry(task).or_default().push(row);
            }
        }
        *self.table.write().unwrap_or_else(|e| e.into_inner()) = table;
    }

    /// Reload the table from `store` through the database breaker.
    pub async fn refresh(
        &self,
        store: Arc<AuditStore>,
        breaker: &CircuitBreaker,
    ) -> Result<usize, BreakerError<AuditError>> {
        let since = Utc::now() - self.window;
        let stats = breaker
            .call(|| async move {
                match tokio::task::spawn_blocking(move || store.route_stats(since)).await {
                    Ok(result) => result,
                    Err(e) => Err(AuditError::TaskFailed(e.to_string())),
                }
            })
            .await?;
        let rows = stats.len();
        self.load(stats);
        Ok(rows)
    }
}

impl RoutePredictor for HistoryPredictor {
    fn predict(&self, task_type: TaskType, _prompt_length: usize, candidates: &[&str]) -> Option<Prediction> {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        table
            .get(&task_type)?
            .iter()
            .filter(|row| candidates.contains(&row.route.as_str()))
            .map(|row| Prediction {
                route: row.route.clone(),
                confidence: row.successes as f64 / (row.total as f64 + PRIOR_SAMPLES),
            })
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
    }
}

/// Refresh `predictor` every `interval_secs` until shut down; `None` when disabled.
pub fn spawn_refresh(
    predictor: Arc<HistoryPredictor>,
    store: Arc<AuditStore>,
    breaker: Arc<CircuitBreaker>,
    interval_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) -> Option<tokio::task::JoinHandle<()>> {
    if interval_secs == 0 {
        tracing::info!("Route predictor refresh disabled");
        return None;
    }
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
            }
            match predictor.refresh(store.clone(), &breaker).await {
                Ok(rows) => tracing::debug!(rows, "Route predictor refreshed"),
                Err(e) => tracing::warn!(error = %e, "Route predictor refresh failed"),
            }
        }
    }))
}

/// Per-request choice between learned and heuristic routing.
#[derive(Debug, Clone, Copy)]
pub struct AbSwitch {
    learned_ratio: f64,
}

impl AbSwitch {
    pub fn new(learned_ratio: f64) -> Self {
        Self {
            learned_ratio: learned_ratio.clamp(0.0, 1.0),
        }
    }

    /// Whether this request consults the predictor.
    pub fn use_learned(&self) -> bool {
        self.learned_ratio > 0.0 && rand::thread_rng().gen::<f64>() < self.learned_ratio
    }
}
