//! Per-caller sliding window rate limiting.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tokio::time::{Duration, Instant};
use tracing::warn;

use crate::error::{Error, Result};

/// Callers tracked before empty windows are swept.
const SWEEP_THRESHOLD: usize = 1024;

pub struct SlidingWindowLimiter {
    window: Duration,
    max_requests: usize,
    calls: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl SlidingWindowLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            window,
            max_requests,
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Record a request from `caller`, or reject it if the window is full.
    pub fn check(&self, caller: &str) -> Result<()> {
        let now = Instant::now();
        let mut calls = self
            .calls
            .lock()
            .map_err(|e| Error::Internal(format!("rate limiter lock poisoned: {}", e)))?;

        if calls.len() > SWEEP_THRESHOLD {
            let window = self.window;
            calls.retain(|_, times| {
                times
                    .back()
                    .is_some_and(|last| now.saturating_duration_since(*last) < window)
            });
        }

        let times = calls.entry(caller.to_string()).or_default();
        while let Some(oldest) = times.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                times.pop_front();
            } else {
                break;
            }
        }

        if times.len() >= self.max_requests {
            let oldest = times.front().copied().unwrap_or(now);
            let reopens_in = self.window.saturating_sub(now.saturating_duration_since(oldest));
            let retry_after_secs = reopens_in.as_secs_f64().ceil().max(1.0) as u64;
            warn!(caller, retry_after_secs, "Rate limit exceeded");
            return Err(Error::RateLimited {
                message: format!(
                    "{} requests per {}s",
                    self.max_requests,
                    self.window.as_secs()
                ),
                retry_after_secs,
            });
        }

        times.push_back(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_rejects_over_limit() {
        let limiter = SlidingWindowLimiter::new(Duration::from_secs(90), 3);
        for _ in 0..3 {
            limiter.check("10.0.0.1").unwrap();
        }
        let err = limiter.check("10.0.0.1").unwrap_err();
        assert!(matches!(err, Error::RateLimited { retry_after_secs: 90, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_callers_are_independent() {
        let limiter = SlidingWindowLimiter::new(Duration::from_secs(90), 1);
        limiter.check("a").unwrap();
        limiter.check("b").unwrap();
        assert!(limiter.check("a").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let limiter = SlidingWindowLimiter::new(Duration::from_secs(90), 2);
        limiter.check("a").unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;
        limiter.check("a").unwrap();

        let err = limiter.check("a").unwrap_err();
        assert!(matches!(err, Error::RateLimited { retry_after_secs: 30, .. }));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(limiter.check("a").is_ok());
    }
}
