//! Resident model cache.
//!
//! Tracks which models the engine holds in memory and decides when to load and
//! evict them. Loads are single-flight per key, models with active requests
//! are never evicted, and loads can be serialized against running generations
//! so that only one model touches the accelerator at a time.

mod eviction;

pub use eviction::{idle_victims, lru_victims, reclaim_victims, ResidentView};

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures_util::stream::{BoxStream, Stream, StreamExt};
use inference_common::{CachedModelInfo, CostModel};
use tokio::sync::{watch, OwnedMutexGuard, OwnedRwLockReadGuard, RwLock};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::engine::InferenceEngine;
use crate::error::{Error, Result};
use crate::memory::{MemoryProbe, MemorySnapshot};

/// Bookkeeping for one resident model.
#[derive(Debug, Clone)]
struct ModelHandle {
    loaded_at: DateTime<Utc>,
    last_used: Instant,
    last_used_at: DateTime<Utc>,
    use_count: u64,
    load_duration: Duration,
    active_requests: usize,
}

impl ModelHandle {
    fn touch(&mut self) {
        self.last_used = Instant::now();
        self.last_used_at = Utc::now();
    }
}

#[derive(Debug, Clone)]
enum LoadStatus {
    Pending,
    Ready,
    Failed(Error),
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, ModelHandle>,
    loading: HashMap<String, watch::Receiver<LoadStatus>>,
    generation_locks: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl CacheState {
    fn views(&self) -> Vec<ResidentView> {
        self.entries
            .iter()
            .map(|(key, handle)| ResidentView {
                key: key.clone(),
                last_used: handle.last_used,
                use_count: handle.use_count,
                active_requests: handle.active_requests,
            })
            .collect()
    }
}

/// Removes `victims` from the resident set and marks each one as in flight
/// until its unload finishes, so `acquire` waits instead of racing the unload.
fn begin_unload(inner: &Arc<Inner>, state: &mut CacheState, victims: Vec<String>) -> Vec<Unloading> {
    victims
        .into_iter()
        .map(|key| {
            state.entries.remove(&key);
            let (tx, rx) = watch::channel(LoadStatus::Pending);
            state.loading.insert(key.clone(), rx);
            Unloading {
                _marker: LoadingGuard {
                    inner: inner.clone(),
                    key: key.clone(),
                },
                _tx: tx,
                key,
            }
        })
        .collect()
}

struct Inner {
    engine: Arc<dyn InferenceEngine>,
    memory: Arc<dyn MemoryProbe>,
    cost: CostModel,
    config: CacheConfig,
    state: Mutex<CacheState>,
    /// Generations hold it shared; serialized loads take it exclusively.
    accelerator: Arc<RwLock<()>>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn grace(&self) -> Duration {
        Duration::from_secs(self.config.eviction_grace_secs)
    }

    fn release(&self, key: &str) {
        let mut state = self.state();
        if let Some(handle) = state.entries.get_mut(key) {
            handle.active_requests = handle.active_requests.saturating_sub(1);
            handle.touch();
        }
    }
}

/// Shared handle to the model cache.
#[derive(Clone)]
pub struct ModelCache {
    inner: Arc<Inner>,
}

enum Lookup {
    Resident(ModelLease),
    Wait(watch::Receiver<LoadStatus>),
    Load(watch::Sender<LoadStatus>),
}

impl ModelCache {
    pub fn new(
        engine: Arc<dyn InferenceEngine>,
        memory: Arc<dyn MemoryProbe>,
        cost: CostModel,
        config: CacheConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                memory,
                cost,
                config,
                state: Mutex::new(CacheState::default()),
                accelerator: Arc::new(RwLock::new(())),
            }),
        }
    }

    pub fn engine(&self) -> &Arc<dyn InferenceEngine> {
        &self.inner.engine
    }

    pub fn memory(&self) -> MemorySnapshot {
        self.inner.memory.snapshot()
    }

    /// Return a lease on a resident model, loading it first if needed.
    ///
    /// Concurrent callers for the same cold key share one load. Waiters give up
    /// after the model's estimated load time.
    pub async fn acquire(&self, key: &str) -> Result<ModelLease> {
        loop {
            match self.lookup(key) {
                Lookup::Resident(lease) => return Ok(lease),
                Lookup::Load(tx) => return self.load_as_owner(key, tx).await,
                Lookup::Wait(mut rx) => {
                    debug!("Waiting for in-flight load of {}", key);
                    let limit = self.inner.cost.load_wait(key);
                    let outcome = tokio::time::timeout(
                        limit,
                        rx.wait_for(|status| !matches!(status, LoadStatus::Pending)),
                    )
                    .await;
                    match outcome {
                        Err(_) => {
                            warn!("Load of {} did not finish within {:?}", key, limit);
                            return Err(Error::LoadWaitTimeout(key.to_string()));
                        }
                        // Loader was cancelled; take another look.
                        Ok(Err(_)) => continue,
                        Ok(Ok(status)) => {
                            if let LoadStatus::Failed(err) = &*status {
                                return Err(err.clone());
                            }
                        }
                    }
                }
            }
        }
    }

    fn lookup(&self, key: &str) -> Lookup {
        let mut state = self.inner.state();
        if let Some(handle) = state.entries.get_mut(key) {
            handle.touch();
            handle.use_count += 1;
            handle.active_requests += 1;
            let load_duration = handle.load_duration;
            return Lookup::Resident(ModelLease::new(self.inner.clone(), key, load_duration));
        }
        if let Some(rx) = state.loading.get(key).cloned() {
            return Lookup::Wait(rx);
        }
        let (tx, rx) = watch::channel(LoadStatus::Pending);
        state.loading.insert(key.to_string(), rx);
        Lookup::Load(tx)
    }

    async fn load_as_owner(&self, key: &str, tx: watch::Sender<LoadStatus>) -> Result<ModelLease> {
        let _loading = LoadingGuard {
            inner: self.inner.clone(),
            key: key.to_string(),
        };

        match self.load(key).await {
            Ok(lease) => {
                tx.send_replace(LoadStatus::Ready);
                Ok(lease)
            }
            Err(err) => {
                if matches!(err, Error::ResourceExhausted(_)) {
                    self.reclaim_memory(true).await;
                }
                tx.send_replace(LoadStatus::Failed(err.clone()));
                Err(err)
            }
        }
    }

    async fn load(&self, key: &str) -> Result<ModelLease> {
        let _exclusive = if self.inner.config.serialize_loads {
            Some(self.wait_for_exclusive(key).await?)
        } else {
            None
        };

        let keep = self.inner.config.max_resident.saturating_sub(1);
        self.evict_to_limit(keep).await;
        self.check_memory(key).await?;

        info!("Loading model {}", key);
        let started = Instant::now();
        self.inner.engine.load_model(key).await?;
        let load_duration = started.elapsed();
        info!("Loaded model {} in {:.1}s", key, load_duration.as_secs_f64());

        let mut state = self.inner.state();
        let now = Utc::now();
        state.entries.insert(
            key.to_string(),
            ModelHandle {
                loaded_at: now,
                last_used: Instant::now(),
                last_used_at: now,
                use_count: 1,
                load_duration,
                active_requests: 1,
            },
        );
        state.loading.remove(key);
        Ok(ModelLease::new(self.inner.clone(), key, load_duration))
    }

    async fn wait_for_exclusive(&self, key: &str) -> Result<tokio::sync::OwnedRwLockWriteGuard<()>> {
        let limit = Duration::from_secs(self.inner.config.serialization_wait_secs);
        let lock = self.inner.accelerator.clone();
        if let Ok(guard) = lock.clone().try_write_owned() {
            return Ok(guard);
        }
        info!("Load of {} waiting for running generations", key);
        tokio::time::timeout(limit, lock.write_owned())
            .await
            .map_err(|_| {
                Error::SerializationTimeout(format!(
                    "load of {} waited {}s",
                    key,
                    limit.as_secs()
                ))
            })
    }

    async fn check_memory(&self, key: &str) -> Result<()> {
        let config = &self.inner.config;
        let snapshot = self.inner.memory.snapshot();
        if snapshot.used_percent > config.memory_warning_percent {
            warn!(
                "Memory at {:.1}% before loading {}",
                snapshot.used_percent, key
            );
        }
        if snapshot.used_percent <= config.memory_critical_percent {
            return Ok(());
        }

        self.reclaim_memory(false).await;
        let after = self.inner.memory.snapshot();
        if after.used_percent > config.memory_critical_percent {
            return Err(Error::ResourceExhausted(format!(
                "memory at {:.1}% ({:.1} GB available), cannot load {}",
                after.used_percent, after.available_gb, key
            )));
        }
        Ok(())
    }

    /// Evict least-recently-used unprotected models until at most `keep_max`
    /// remain. Returns the evicted keys.
    pub async fn evict_to_limit(&self, keep_max: usize) -> Vec<String> {
        let unloading = {
            let mut state = self.inner.state();
            let victims = lru_victims(&state.views(), keep_max, Instant::now(), self.inner.grace());
            begin_unload(&self.inner, &mut state, victims)
        };
        self.unload_all(unloading, "over resident limit").await
    }

    /// Free memory when usage is critical, or unconditionally when `aggressive`.
    pub async fn reclaim_memory(&self, aggressive: bool) -> Vec<String> {
        let config = &self.inner.config;
        let snapshot = self.inner.memory.snapshot();
        if !aggressive && snapshot.used_percent <= config.memory_critical_percent {
            return Vec::new();
        }
        let emergency = aggressive || snapshot.used_percent > config.memory_emergency_percent;
        warn!(
            "Reclaiming memory at {:.1}% (emergency: {})",
            snapshot.used_percent, emergency
        );

        let unloading = {
            let mut state = self.inner.state();
            let victims = reclaim_victims(
                &state.views(),
                emergency,
                config.reclaim_keep_count,
                Instant::now(),
                self.inner.grace(),
            );
            begin_unload(&self.inner, &mut state, victims)
        };
        let victims = self.unload_all(unloading, "memory pressure").await;
        if !victims.is_empty() {
            let after = self.inner.memory.snapshot();
            info!(
                "Freed {} model(s), memory now {:.1}%",
                victims.len(),
                after.used_percent
            );
        }
        victims
    }

    /// Periodic maintenance: enforce the resident limit, drop long-idle models,
    /// and reclaim memory if it is critical.
    pub async fn cleanup(&self) -> Vec<String> {
        let mut evicted = self.evict_to_limit(self.inner.config.max_resident).await;

        let idle = Duration::from_secs(self.inner.config.idle_unload_secs);
        let unloading = {
            let mut state = self.inner.state();
            let victims = idle_victims(&state.views(), idle, Instant::now(), self.inner.grace());
            begin_unload(&self.inner, &mut state, victims)
        };
        evicted.extend(self.unload_all(unloading, "idle").await);

        evicted.extend(self.reclaim_memory(false).await);
        evicted
    }

    async fn unload_all(&self, unloading: Vec<Unloading>, reason: &str) -> Vec<String> {
        let mut evicted = Vec::with_capacity(unloading.len());
        for victim in unloading {
            info!("Evicting model {} ({})", victim.key, reason);
            if let Err(e) = self.inner.engine.unload_model(&victim.key).await {
                warn!("Failed to unload {}: {}", victim.key, e);
            }
            evicted.push(victim.key.clone());
        }
        evicted
    }

    pub fn is_resident(&self, key: &str) -> bool {
        self.inner.state().entries.contains_key(key)
    }

    pub fn resident_count(&self) -> usize {
        self.inner.state().entries.len()
    }

    /// Resident models for health reporting, most recently used first.
    pub fn snapshot(&self) -> Vec<CachedModelInfo> {
        let state = self.inner.state();
        let mut models: Vec<(Instant, CachedModelInfo)> = state
            .entries
            .iter()
            .map(|(key, handle)| (handle.last_used, model_info(key, handle)))
            .collect();
        models.sort_by(|a, b| b.0.cmp(&a.0));
        models.into_iter().map(|(_, info)| info).collect()
    }

    pub fn model_info(&self, key: &str) -> Option<CachedModelInfo> {
        let state = self.inner.state();
        state.entries.get(key).map(|handle| model_info(key, handle))
    }

    /// Loaded-at time of a resident model.
    pub fn loaded_at(&self, key: &str) -> Option<DateTime<Utc>> {
        self.inner.state().entries.get(key).map(|h| h.loaded_at)
    }
}

fn model_info(key: &str, handle: &ModelHandle) -> CachedModelInfo {
    CachedModelInfo {
        name: key.to_string(),
        use_count: handle.use_count,
        last_used: Some(handle.last_used_at.to_rfc3339()),
        load_time_seconds: handle.load_duration.as_secs_f64(),
        active_requests: handle.active_requests,
    }
}

/// Clears the in-flight marker if a load is abandoned.
struct LoadingGuard {
    inner: Arc<Inner>,
    key: String,
}

impl Drop for LoadingGuard {
    fn drop(&mut self) {
        self.inner.state().loading.remove(&self.key);
    }
}

/// A model being unloaded. Dropping it clears the in-flight marker and then
/// wakes anyone waiting to load the same key.
struct Unloading {
    key: String,
    _marker: LoadingGuard,
    _tx: watch::Sender<LoadStatus>,
}

/// A claim on a resident model. The model cannot be evicted while a lease is
/// alive; dropping it releases the claim.
pub struct ModelLease {
    inner: Arc<Inner>,
    key: String,
    load_duration: Duration,
}

impl std::fmt::Debug for ModelLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelLease")
            .field("key", &self.key)
            .field("load_duration", &self.load_duration)
            .finish_non_exhaustive()
    }
}

impl ModelLease {
    fn new(inner: Arc<Inner>, key: &str, load_duration: Duration) -> Self {
        Self {
            inner,
            key: key.to_string(),
            load_duration,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Time budget for a generation of `max_tokens` tokens.
    pub fn timeout(&self, max_tokens: u32) -> Duration {
        self.inner
            .cost
            .timeout(&self.key, max_tokens, Some(self.load_duration.as_secs_f64()))
    }

    async fn begin_generation(&self) -> (OwnedMutexGuard<()>, OwnedRwLockReadGuard<()>) {
        let model_lock = {
            let mut state = self.inner.state();
            state
                .generation_locks
                .entry(self.key.clone())
                .or_default()
                .clone()
        };
        let turn = model_lock.lock_owned().await;
        let shared = self.inner.accelerator.clone().read_owned().await;
        (turn, shared)
    }

    fn timed_out(&self, limit: Duration) -> Error {
        warn!("Generation on {} exceeded {:.0}s", self.key, limit.as_secs_f64());
        Error::GenerationTimeout {
            model: self.key.clone(),
            limit_secs: limit.as_secs_f64(),
        }
    }

    /// Run one generation, one at a time per model.
    pub async fn generate(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let limit = self.timeout(max_tokens);
        let run = async {
            let _turn = self.begin_generation().await;
            self.inner.engine.generate(&self.key, prompt, max_tokens).await
        };
        tokio::time::timeout(limit, run)
            .await
            .map_err(|_| self.timed_out(limit))?
    }

    /// Start a streamed generation. The returned stream keeps the lease and the
    /// model's generation slot until it is dropped.
    pub async fn stream(self, prompt: &str, max_tokens: u32) -> Result<GenerationStream> {
        let limit = self.timeout(max_tokens);
        let start = async {
            let turn = self.begin_generation().await;
            let pieces = self
                .inner
                .engine
                .generate_stream(&self.key, prompt, max_tokens)
                .await?;
            Ok::<_, Error>((turn, pieces))
        };
        let (turn, pieces) = tokio::time::timeout(limit, start)
            .await
            .map_err(|_| self.timed_out(limit))??;
        Ok(GenerationStream {
            pieces,
            _turn: turn,
            lease: self,
        })
    }
}

impl Drop for ModelLease {
    fn drop(&mut self) {
        self.inner.release(&self.key);
    }
}

/// Text pieces from a streamed generation.
pub struct GenerationStream {
    pieces: BoxStream<'static, Result<String>>,
    _turn: (OwnedMutexGuard<()>, OwnedRwLockReadGuard<()>),
    lease: ModelLease,
}

impl GenerationStream {
    pub fn model(&self) -> &str {
        self.lease.key()
    }
}

impl Stream for GenerationStream {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.pieces.poll_next_unpin(cx)
    }
}
