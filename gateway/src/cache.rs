//! Short-lived cache of completed generations.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use lru::LruCache;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::time::{Duration, Instant};

use crate::config::ResponseCacheConfig;
use crate::facade::Completion;

#[derive(Debug, Clone)]
struct Entry {
    completion: Completion,
    stored_at: Instant,
}

/// Cache statistics reported on `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub enabled: bool,
    pub entries: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// Cache of completions keyed by `(prompt, category, model)`.
///
/// Only short prompts without images are cached, and only short responses are
/// stored. Entries expire after the TTL; when full, expired entries are purged
/// first, then the least recently used one.
pub struct ResponseCache {
    config: ResponseCacheConfig,
    entries: Mutex<LruCache<String, Entry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    pub fn new(config: ResponseCacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.ttl_secs)
    }

    /// Cache key for a request, or `None` when the request is not cacheable.
    pub fn key(
        &self,
        prompt: &str,
        category: Option<&str>,
        model: Option<&str>,
        has_images: bool,
    ) -> Option<String> {
        if !self.config.enabled
            || has_images
            || prompt.chars().count() > self.config.max_prompt_chars
        {
            return None;
        }
        let raw = format!("{}|{}|{}", prompt, category.unwrap_or(""), model.unwrap_or(""));
        let digest = hex::encode(Sha256::digest(raw.as_bytes()));
        Some(digest[..32].to_string())
    }

    pub fn get(&self, key: &str) -> Option<Completion> {
        let ttl = self.ttl();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let found = entries
            .get(key)
            .map(|entry| (entry.stored_at.elapsed() < ttl).then(|| entry.completion.clone()));
        let fresh = match found {
            Some(Some(completion)) => Some(completion),
            Some(None) => {
                entries.pop(key);
                None
            }
            None => None,
        };
        drop(entries);

        match fresh {
            Some(completion) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, "Response cache hit");
                Some(completion)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a completion. Returns false when the response is too long to cache.
    pub fn insert(&self, key: String, completion: Completion) -> bool {
        if completion.text.chars().count() >= self.config.max_response_chars
            || self.config.max_entries == 0
        {
            return false;
        }
        let ttl = self.ttl();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        if !entries.contains(&key) && entries.len() >= entries.cap().get() {
            let expired: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.stored_at.elapsed() >= ttl)
                .map(|(k, _)| k.clone())
                .collect();
            for k in expired {
                entries.pop(&k);
            }
        }

        entries.put(
            key,
            Entry {
                completion,
                stored_at: Instant::now(),
            },
        );
        true
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            enabled: self.config.enabled,
            entries: self.len(),
            max_entries: self.config.max_entries,
            hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}
