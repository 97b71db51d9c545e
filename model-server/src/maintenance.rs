//! Startup preload and the periodic cache cleanup loop.

use tokio::sync::watch;
use tokio::time::{Duration, MissedTickBehavior};

use crate::cache::ModelCache;

/// Load each configured model once so the first request does not pay for it.
///
/// Failures are logged; the server runs without the model.
pub async fn preload(cache: &ModelCache, models: &[String]) -> Vec<String> {
    let mut loaded = Vec::new();
    for key in models {
        match cache.acquire(key).await {
            Ok(lease) => {
                tracing::info!("Preloaded model {}", key);
                loaded.push(lease.key().to_string());
            }
            Err(e) => tracing::warn!("Preload of {} failed: {}", key, e),
        }
    }
    loaded
}

/// Runs `ModelCache::cleanup` on a fixed interval until shut down.
pub struct CleanupTask {
    cache: ModelCache,
    interval: Duration,
}

impl CleanupTask {
    pub fn new(cache: ModelCache, interval: Duration) -> Self {
        Self { cache, interval }
    }

    /// Run the loop. Returns when `shutdown` flips to true or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::debug!("Cache cleanup loop stopping");
                        return;
                    }
                    continue;
                }
            }

            let evicted = self.cache.cleanup().await;
            if evicted.is_empty() {
                tracing::debug!(
                    "Cache cleanup: nothing to evict ({} resident)",
                    self.cache.resident_count()
                );
            } else {
                tracing::info!("Cache cleanup evicted {:?}", evicted);
            }
        }
    }
}

/// Spawn the cleanup loop unless `interval_secs` is 0.
pub fn spawn_cleanup(
    cache: ModelCache,
    interval_secs: u64,
    shutdown: watch::Receiver<bool>,
) -> Option<tokio::task::JoinHandle<()>> {
    if interval_secs == 0 {
        tracing::info!("Periodic cache cleanup disabled");
        return None;
    }
    let task = CleanupTask::new(cache, Duration::from_secs(interval_secs));
    Some(tokio::spawn(task.run(shutdown)))
}
