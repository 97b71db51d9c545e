//! Admission control in front of generation.
//!
//! At most `max_concurrent` requests hold a permit at once. Requests that
//! cannot start immediately wait in one of three priority lanes; a finishing
//! request hands its slot straight to the oldest waiter in the highest
//! non-empty lane, so a slot is never up for grabs between release and grant.

mod rate_limit;

pub use rate_limit::SlidingWindowLimiter;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use inference_common::Priority;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Counters exposed on `/queue/stats`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub active: usize,
    pub max_concurrent: usize,
    pub queued: usize,
    pub max_queued: usize,
    pub queued_high: usize,
    pub queued_medium: usize,
    pub queued_low: usize,
    pub processed: u64,
    pub rejected: u64,
    pub timed_out: u64,
    pub avg_wait_seconds: f64,
    pub max_wait_seconds: f64,
}

struct Waiter {
    id: u64,
    priority: Priority,
    model_key: Option<String>,
    enqueued_at: Instant,
    tx: oneshot::Sender<AdmissionPermit>,
}

#[derive(Default)]
struct Counters {
    processed: u64,
    rejected: u64,
    timed_out: u64,
    total_wait: Duration,
}

#[derive(Default)]
struct QueueState {
    active: usize,
    lanes: [VecDeque<Waiter>; 3],
    next_id: u64,
    counters: Counters,
}

impl QueueState {
    fn queued(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    fn pop_next(&mut self) -> Option<Waiter> {
        self.lanes.iter_mut().find_map(VecDeque::pop_front)
    }

    fn remove(&mut self, id: u64) -> bool {
        for lane in self.lanes.iter_mut() {
            if let Some(pos) = lane.iter().position(|w| w.id == id) {
                lane.remove(pos);
                return true;
            }
        }
        false
    }

    fn record_grant(&mut self, waited: Duration) {
        self.counters.processed += 1;
        self.counters.total_wait += waited;
    }
}

struct QueueInner {
    max_concurrent: usize,
    max_queued: usize,
    max_wait: Duration,
    state: Mutex<QueueState>,
}

impl QueueInner {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pass a released slot to the next live waiter, or free it.
    fn hand_off(self: &Arc<Self>) {
        let mut state = self.state();
        while let Some(waiter) = state.pop_next() {
            let permit = AdmissionPermit::new(self.clone());
            match waiter.tx.send(permit) {
                Ok(()) => {
                    let waited = waiter.enqueued_at.elapsed();
                    debug!(
                        priority = %waiter.priority,
                        model = ?waiter.model_key,
                        waited_ms = waited.as_millis() as u64,
                        "Admission slot handed off"
                    );
                    state.record_grant(waited);
                    return;
                }
                // Waiter gave up; its permit must not hand off again.
                Err(mut permit) => permit.armed = false,
            }
        }
        state.active = state.active.saturating_sub(1);
    }
}

/// Priority-aware bounded concurrency gate.
#[derive(Clone)]
pub struct AdmissionQueue {
    inner: Arc<QueueInner>,
}

impl AdmissionQueue {
    pub fn new(max_concurrent: usize, max_queued: usize, max_wait: Duration) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                max_concurrent,
                max_queued,
                max_wait,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    pub fn max_wait(&self) -> Duration {
        self.inner.max_wait
    }

    /// Wait for a generation slot.
    ///
    /// Fails with `QueueFull` when the waiting set is at capacity and with
    /// `Overloaded` when no slot frees up within the queue wait.
    pub async fn admit(&self, priority: Priority, model_key: Option<&str>) -> Result<AdmissionPermit> {
        let (id, mut rx) = {
            let mut state = self.inner.state();
            let queued = state.queued();
            if state.active < self.inner.max_concurrent && queued == 0 {
                state.active += 1;
                state.record_grant(Duration::ZERO);
                return Ok(AdmissionPermit::new(self.inner.clone()));
            }
            if queued >= self.inner.max_queued {
                state.counters.rejected += 1;
                warn!(queued, priority = %priority, "Admission queue full");
                return Err(Error::QueueFull(queued));
            }

            let id = state.next_id;
            state.next_id += 1;
            let (tx, rx) = oneshot::channel();
            state.lanes[priority.rank()].push_back(Waiter {
                id,
                priority,
                model_key: model_key.map(str::to_string),
                enqueued_at: Instant::now(),
                tx,
            });
            debug!(queued = queued + 1, priority = %priority, "Request queued for admission");
            (id, rx)
        };

        let mut waiting = WaitingGuard {
            inner: self.inner.clone(),
            id: Some(id),
        };
        match tokio::time::timeout(self.inner.max_wait, &mut rx).await {
            Ok(Ok(permit)) => {
                waiting.id = None;
                Ok(permit)
            }
            Ok(Err(_)) => Err(Error::Internal("admission waiter dropped".to_string())),
            Err(_) => {
                if waiting.remove() {
                    self.inner.state().counters.timed_out += 1;
                    let retry_after_secs = self.inner.max_wait.as_secs().clamp(1, 60);
                    warn!(priority = %priority, "Timed out waiting for admission");
                    return Err(Error::Overloaded {
                        message: format!(
                            "no slot within {:.0}s",
                            self.inner.max_wait.as_secs_f64()
                        ),
                        retry_after_secs,
                    });
                }
                // The slot arrived as the timer fired.
                rx.try_recv()
                    .map_err(|_| Error::Internal("admission permit lost".to_string()))
            }
        }
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state();
        let c = &state.counters;
        QueueStats {
            active: state.active,
            max_concurrent: self.inner.max_concurrent,
            queued: state.queued(),
            max_queued: self.inner.max_queued,
            queued_high: state.lanes[Priority::High.rank()].len(),
            queued_medium: state.lanes[Priority::Medium.rank()].len(),
            queued_low: state.lanes[Priority::Low.rank()].len(),
            processed: c.processed,
            rejected: c.rejected,
            timed_out: c.timed_out,
            avg_wait_seconds: if c.processed == 0 {
                0.0
            } else {
                c.total_wait.as_secs_f64() / c.processed as f64
            },
            max_wait_seconds: self.inner.max_wait.as_secs_f64(),
        }
    }

    pub fn active(&self) -> usize {
        self.inner.state().active
    }

    pub fn queued(&self) -> usize {
        self.inner.state().queued()
    }
}

/// Removes an abandoned waiter from its lane.
struct WaitingGuard {
    inner: Arc<QueueInner>,
    id: Option<u64>,
}

impl WaitingGuard {
    fn remove(&mut self) -> bool {
        match self.id.take() {
            Some(id) => self.inner.state().remove(id),
            None => false,
        }
    }
}

impl Drop for WaitingGuard {
    fn drop(&mut self) {
        self.remove();
    }
}

/// A held admission slot. Dropping it releases the slot.
pub struct AdmissionPermit {
    inner: Arc<QueueInner>,
    armed: bool,
}

impl AdmissionPermit {
    fn new(inner: Arc<QueueInner>) -> Self {
        Self { inner, armed: true }
    }
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("armed", &self.armed)
            .finish_non_exhaustive()
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if self.armed {
            self.armed = false;
            self.inner.hand_off();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_admits_up_to_limit() {
        let queue = AdmissionQueue::new(2, 10, Duration::from_secs(60));
        let a = queue.admit(Priority::High, None).await.unwrap();
        let _b = queue.admit(Priority::High, None).await.unwrap();
        assert_eq!(queue.active(), 2);

        let q = queue.clone();
        let waiter = tokio::spawn(async move { q.admit(Priority::Low, None).await.map(|_| ()) });
        tokio::task::yield_now().await;
        assert_eq!(queue.queued(), 1);

        drop(a);
        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(queue.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_higher_priority_served_first() {
        let queue = AdmissionQueue::new(1, 10, Duration::from_secs(60));
        let held = queue.admit(Priority::Medium, None).await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for priority in [Priority::Low, Priority::Medium, Priority::High] {
            let q = queue.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = q.admit(priority, None).await.unwrap();
                order.lock().unwrap().push(priority);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }));
            tokio::task::yield_now().await;
        }

        drop(held);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(
            *order.lock().unwrap(),
            vec![Priority::High, Priority::Medium, Priority::Low]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_full() {
        let queue = AdmissionQueue::new(1, 1, Duration::from_secs(60));
        let _held = queue.admit(Priority::High, None).await.unwrap();

        let q = queue.clone();
        let _waiting = tokio::spawn(async move { q.admit(Priority::High, None).await.map(|_| ()) });
        tokio::task::yield_now().await;

        let err = queue.admit(Priority::High, None).await.unwrap_err();
        assert!(matches!(err, Error::QueueFull(1)));
        assert_eq!(queue.stats().rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout_is_overloaded() {
        let queue = AdmissionQueue::new(1, 10, Duration::from_secs(5));
        let _held = queue.admit(Priority::High, None).await.unwrap();

        let err = queue.admit(Priority::High, Some("fast")).await.unwrap_err();
        assert!(matches!(err, Error::Overloaded { retry_after_secs: 5, .. }));
        assert_eq!(queue.queued(), 0);
        assert_eq!(queue.stats().timed_out, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_waiter_does_not_leak_slot() {
        let queue = AdmissionQueue::new(1, 10, Duration::from_secs(60));
        let held = queue.admit(Priority::High, None).await.unwrap();

        let q = queue.clone();
        let abandoned = tokio::spawn(async move { q.admit(Priority::High, None).await.map(|_| ()) });
        tokio::task::yield_now().await;
        abandoned.abort();
        let _ = abandoned.await;

        drop(held);
        assert_eq!(queue.active(), 0);
        assert!(queue.admit(Priority::Low, None).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_max_concurrent() {
        let queue = AdmissionQueue::new(2, 10, Duration::from_secs(60));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let q = queue.clone();
            let running = running.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = q.admit(Priority::High, None).await.unwrap();
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(1)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        let stats = queue.stats();
        assert_eq!(stats.processed, 5);
        assert_eq!(stats.active, 0);
    }
}
