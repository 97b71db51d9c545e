//! Per-dependency circuit breakers.
//!
//! A breaker is CLOSED while its dependency works, OPEN (rejecting without
//! calling) after `failure_threshold` consecutive failures, and HALF_OPEN once
//! `recovery_timeout` has passed, letting exactly one trial call through.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::time::{Duration, Instant};

use crate::config::{BreakerConfig, BreakersConfig, NodeKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Outcome of a call made through a breaker.
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// Rejected without calling the dependency.
    #[error("Circuit {name} is open, retry in {}s", .remaining.as_secs())]
    Open { name: String, remaining: Duration },
    /// The dependency was called and failed.
    #[error("{0}")]
    Inner(E),
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    rejected: u64,
}

/// Circuit breaker guarding one dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<Inner>,
}

/// Point-in-time view of a breaker for status output.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    /// Seconds until a trial call is allowed, while open.
    pub retry_in_secs: Option<f64>,
    pub rejected: u64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
                rejected: 0,
            }),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &BreakerConfig) -> Self {
        Self::new(
            name,
            config.failure_threshold,
            Duration::from_secs_f64(config.recovery_timeout_secs.max(0.0)),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remaining(&self, inner: &Inner) -> Duration {
        inner
            .opened_at
            .map(|at| self.recovery_timeout.saturating_sub(at.elapsed()))
            .unwrap_or(Duration::ZERO)
    }

    /// Current state. An open breaker whose recovery timeout has passed reports
    /// `HalfOpen`: the next call will be the trial.
    pub fn state(&self) -> BreakerState {
        let inner = self.lock();
        match inner.state {
            BreakerState::Open if self.remaining(&inner).is_zero() => BreakerState::HalfOpen,
            state => state,
        }
    }

    /// Ask to make one call. On rejection returns the time left until a trial
    /// is allowed (zero when another trial is already running).
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>, Duration> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(BreakerPermit::new(self, false)),
            BreakerState::Open => {
                let remaining = self.remaining(&inner);
                if remaining.is_zero() {
                    inner.state = BreakerState::HalfOpen;
                    inner.trial_in_flight = true;
                    tracing::info!(breaker = %self.name, "Circuit half-open, allowing a trial call");
                    Ok(BreakerPermit::new(self, true))
                } else {
                    inner.rejected += 1;
                    Err(remaining)
                }
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    inner.rejected += 1;
                    Err(Duration::ZERO)
                } else {
                    inner.trial_in_flight = true;
                    Ok(BreakerPermit::new(self, true))
                }
            }
        }
    }

    /// Run `f` through the breaker.
    pub async fn call<T, E, F, Fut>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.try_acquire().map_err(|remaining| BreakerError::Open {
            name: self.name.clone(),
            remaining,
        })?;
        match f().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                permit.failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    fn record_success(&self, trial: bool) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::HalfOpen if trial => {
                inner.state = BreakerState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.trial_in_flight = false;
                tracing::info!(breaker = %self.name, "Circuit closed after successful trial");
            }
            BreakerState::Closed => inner.consecutive_failures = 0,
            // A call admitted before the circuit opened finished late.
            _ => {}
        }
    }

    fn record_failure(&self, trial: bool) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        match inner.state {
            BreakerState::Closed if inner.consecutive_failures >= self.failure_threshold => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                tracing::error!(
                    breaker = %self.name,
                    failures = inner.consecutive_failures,
                    "Failure threshold reached, circuit open"
                );
            }
            BreakerState::HalfOpen if trial => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.trial_in_flight = false;
                tracing::warn!(breaker = %self.name, "Trial call failed, circuit open again");
            }
            _ => {}
        }
    }

    fn abandon_trial(&self) {
        let mut inner = self.lock();
        if inner.state == BreakerState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        let retry_in_secs = match inner.state {
            BreakerState::Open => Some(self.remaining(&inner).as_secs_f64()),
            _ => None,
        };
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.failure_threshold,
            retry_in_secs,
            rejected: inner.rejected,
        }
    }
}

/// Permission to make one call. Report the outcome with `success` or
/// `failure`; dropping an unsettled trial permit frees the trial slot.
#[derive(Debug)]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> BreakerPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success(self.trial);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.trial);
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.abandon_trial();
        }
    }
}

/// The gateway's breakers, one per dependency.
#[derive(Debug, Clone)]
pub struct Breakers {
    pub db: Arc<CircuitBreaker>,
    pub accelerator: Arc<CircuitBreaker>,
    pub general: Arc<CircuitBreaker>,
    pub cloud: Arc<CircuitBreaker>,
}

impl Breakers {
    pub fn new(config: &BreakersConfig) -> Self {
        Self {
            db: Arc::new(CircuitBreaker::from_config("db", &config.db)),
            accelerator: Arc::new(CircuitBreaker::from_config(
                "accelerator",
                &config.accelerator,
            )),
            general: Arc::new(CircuitBreaker::from_config("general", &config.general)),
            cloud: Arc::new(CircuitBreaker::from_config("cloud", &config.cloud)),
        }
    }

    /// Breaker shared by every node of one backend class.
    pub fn for_kind(&self, kind: NodeKind) -> &CircuitBreaker {
        match kind {
            NodeKind::Accelerator => &self.accelerator,
            NodeKind::General => &self.general,
        }
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        [&self.db, &self.accelerator, &self.general, &self.cloud]
            .into_iter()
            .map(|b| b.snapshot())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("test", 3, Duration::from_secs(60))
    }

    async fn fail(breaker: &CircuitBreaker, calls: &AtomicUsize) {
        let result: Result<(), _> = breaker
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("boom")
            })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_rejects_without_calling() {
        let breaker = breaker();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            fail(&breaker, &calls).await;
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        let started = Instant::now();
        let result = breaker
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &str>(())
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Open { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(breaker.snapshot().rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_failures() {
        let breaker = breaker();
        let calls = AtomicUsize::new(0);
        fail(&breaker, &calls).await;
        fail(&breaker, &calls).await;
        breaker.call(|| async { Ok::<_, &str>(()) }).await.unwrap();
        fail(&breaker, &calls).await;
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_allows_exactly_one_trial() {
        let breaker = breaker();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            fail(&breaker, &calls).await;
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        let trial = breaker.try_acquire().unwrap();
        assert!(trial.is_trial());
        assert_eq!(breaker.try_acquire().unwrap_err(), Duration::ZERO);

        trial.success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens_with_fresh_timer() {
        let breaker = breaker();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            fail(&breaker, &calls).await;
        }
        tokio::time::advance(Duration::from_secs(60)).await;
        fail(&breaker, &calls).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        let remaining = breaker.try_acquire().unwrap_err();
        assert_eq!(remaining, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_frees_the_slot() {
        let breaker = breaker();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            fail(&breaker, &calls).await;
        }
        tokio::time::advance(Duration::from_secs(61)).await;

        drop(breaker.try_acquire().unwrap());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.try_acquire().unwrap().is_trial());
    }

    #[test]
    fn test_registry_routes_kinds_to_their_breaker() {
        let breakers = Breakers::new(&BreakersConfig::default());
        assert_eq!(breakers.for_kind(NodeKind::Accelerator).name(), "accelerator");
        assert_eq!(breakers.for_kind(NodeKind::General).name(), "general");
        assert_eq!(breakers.snapshots().len(), 4);
    }
}
