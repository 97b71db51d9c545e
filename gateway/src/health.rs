//! Health probing with a TTL-bounded healthy-node list.

use std::cmp::Ordering;
use std::sync::{Arc, Mutex};

use futures_util::future::join_all;
use tokio::time::{Duration, Instant};

use crate::config::NodeKind;
use crate::registry::{BackendNode, NodeRegistry};

const DEFAULT_OVERLOAD_TTL: Duration = Duration::from_secs(5);

/// Probes every node and caches the healthy ones.
///
/// A non-empty result is reused for the TTL. An empty result is never cached,
/// so the next call probes again. Accelerator load changes faster than
/// liveness, so while the list is cached their overload flag is re-read once
/// it is older than the overload TTL.
pub struct HealthProbe {
    registry: Arc<NodeRegistry>,
    ttl: Duration,
    overload_ttl: Duration,
    timeout: Duration,
    cached: Mutex<Option<(Instant, Vec<Arc<BackendNode>>)>>,
}

/// Best node first: higher performance score, then lower static priority,
/// then lower probe latency.
pub fn compare_nodes(a: &BackendNode, b: &BackendNode) -> Ordering {
    let (sa, sb) = (a.stats(), b.stats());
    sb.performance_score
        .partial_cmp(&sa.performance_score)
        .unwrap_or(Ordering::Equal)
        .then(a.config.priority.cmp(&b.config.priority))
        .then(
            sa.last_latency
                .unwrap_or(Duration::MAX)
                .cmp(&sb.last_latency.unwrap_or(Duration::MAX)),
        )
}

impl HealthProbe {
    pub fn new(registry: Arc<NodeRegistry>, ttl: Duration, timeout: Duration) -> Self {
        Self {
            registry,
            ttl,
            overload_ttl: DEFAULT_OVERLOAD_TTL,
            timeout,
            cached: Mutex::new(None),
        }
    }

    pub fn with_overload_ttl(mut self, overload_ttl: Duration) -> Self {
        self.overload_ttl = overload_ttl;
        self
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    fn fresh(&self) -> Option<Vec<Arc<BackendNode>>> {
        let cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        cached
            .as_ref()
            .filter(|(at, _)| at.elapsed() < self.ttl)
            .map(|(_, nodes)| nodes.clone())
    }

    /// Healthy nodes, best first. `force` skips the cache.
    pub async fn healthy_nodes(&self, force: bool) -> Vec<Arc<BackendNode>> {
        if !force {
            if let Some(nodes) = self.fresh() {
                self.refresh_overload(&nodes).await;
                return nodes;
            }
        }

        let nodes = self.probe_all().await;
        let mut cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        *cached = if nodes.is_empty() {
            None
        } else {
            Some((Instant::now(), nodes.clone()))
        };
        nodes
    }

    /// Probe every node concurrently and return the healthy ones, sorted.
    pub async fn probe_all(&self) -> Vec<Arc<BackendNode>> {
        let probes = self.registry.nodes().iter().map(|node| {
            let node = node.clone();
            let timeout = self.timeout;
            async move {
                let result = node.backend.probe_health(timeout).await;
                match &result {
                    Ok(health) => {
                        tracing::debug!(
                            node = %node.name(),
                            latency_ms = health.latency.as_millis() as u64,
                            overloaded = health.overloaded,
                            "Node healthy"
                        );
                        node.record_probe(Some(health));
                    }
                    Err(e) => {
                        tracing::warn!(node = %node.name(), error = %e, "Node unhealthy");
                        node.record_probe(None);
                    }
                }
                result.ok().map(|_| node)
            }
        });

        let mut healthy: Vec<Arc<BackendNode>> =
            join_all(probes).await.into_iter().flatten().collect();
        healthy.sort_by(|a, b| compare_nodes(a, b));
        if healthy.is_empty() {
            tracing::error!("No healthy backend nodes");
        }
        healthy
    }

    /// Re-read the load of accelerator nodes whose last probe is older than
    /// the overload TTL. A failed read leaves the node's stats untouched.
    async fn refresh_overload(&self, nodes: &[Arc<BackendNode>]) {
        let stale = nodes.iter().filter(|node| {
            node.kind() == NodeKind::Accelerator
                && node
                    .stats()
                    .probed_at
                    .map_or(true, |at| at.elapsed() >= self.overload_ttl)
        });
        let probes = stale.map(|node| async move {
            match node.backend.probe_health(self.timeout).await {
                Ok(health) => {
                    if health.overloaded != node.is_overloaded() {
                        tracing::info!(
                            node = %node.name(),
                            overloaded = health.overloaded,
                            "Accelerator load changed"
                        );
                    }
                    node.record_probe(Some(&health));
                }
                Err(e) => {
                    tracing::debug!(node = %node.name(), error = %e, "Load check failed");
                }
            }
        });
        join_all(probes).await;
    }

    /// Drop the cached list so the next call probes again.
    pub fn invalidate(&self) {
        *self.cached.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}
