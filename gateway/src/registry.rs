//! Registry of configured backend nodes and their live statistics.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use tokio::time::Instant;

use crate::backend::{build_backend, Backend, NodeHealth};
use crate::config::{NodeConfig, NodeKind};

/// Weight of the newest observation in the moving averages.
const EMA_ALPHA: f64 = 0.2;
const INITIAL_SUCCESS_RATE: f64 = 0.9;
const INITIAL_PERFORMANCE: f64 = 0.8;

/// Dynamic state of a node, updated by probes and dispatch outcomes.
#[derive(Debug, Clone)]
pub struct NodeStats {
    pub healthy: bool,
    /// Self-declared saturation from the last probe.
    pub overloaded: bool,
    pub last_latency: Option<Duration>,
    /// Moving average of dispatch speed relative to the call's budget (0..=1).
    pub performance_score: f64,
    /// Moving average of dispatch success (0..=1).
    pub success_rate: f64,
    pub last_checked: Option<DateTime<Utc>>,
    pub probed_at: Option<Instant>,
}

impl Default for NodeStats {
    fn default() -> Self {
        Self {
            healthy: false,
            overloaded: false,
            last_latency: None,
            performance_score: INITIAL_PERFORMANCE,
            success_rate: INITIAL_SUCCESS_RATE,
            last_checked: None,
            probed_at: None,
        }
    }
}

/// A backend node: static configuration, client and live statistics.
pub struct BackendNode {
    pub config: NodeConfig,
    pub backend: Arc<dyn Backend>,
    stats: RwLock<NodeStats>,
}

/// Node view reported on `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub name: String,
    pub routing_key: String,
    pub kind: NodeKind,
    pub base_url: String,
    pub priority: u32,
    pub healthy: bool,
    pub overloaded: bool,
    pub latency_ms: Option<u64>,
    pub performance_score: f64,
    pub success_rate: f64,
    pub last_checked: Option<DateTime<Utc>>,
}

fn ema(previous: f64, sample: f64) -> f64 {
    (1.0 - EMA_ALPHA) * previous + EMA_ALPHA * sample
}

impl BackendNode {
    pub fn new(config: NodeConfig, backend: Arc<dyn Backend>) -> Self {
        Self {
            config,
            backend,
            stats: RwLock::new(NodeStats::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn routing_key(&self) -> &str {
        &self.config.routing_key
    }

    pub fn kind(&self) -> NodeKind {
        self.config.kind
    }

    pub fn stats(&self) -> NodeStats {
        self.stats.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_overloaded(&self) -> bool {
        self.stats().overloaded
    }

    /// Apply a health probe result.
    pub fn record_probe(&self, probe: Option<&NodeHealth>) {
        let mut stats = self.stats.write().unwrap_or_else(|e| e.into_inner());
        stats.last_checked = Some(Utc::now());
        stats.probed_at = Some(Instant::now());
        match probe {
            Some(health) => {
                stats.healthy = true;
                stats.overloaded = health.overloaded;
                stats.last_latency = Some(health.latency);
            }
            None => {
                stats.healthy = false;
                stats.overloaded = false;
            }
        }
    }

    /// Fold one dispatch outcome into the moving averages. `budget` is the
    /// timeout the call ran under.
    pub fn record_outcome(&self, success: bool, elapsed: Duration, budget: Duration) {
        let speed = if success && !budget.is_zero() {
            (1.0 - elapsed.as_secs_f64() / budget.as_secs_f64()).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let mut stats = self.stats.write().unwrap_or_else(|e| e.into_inner());
        stats.success_rate = ema(stats.success_rate, if success { 1.0 } else { 0.0 });
        stats.performance_score = ema(stats.performance_score, speed);
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        let stats = self.stats();
        NodeSnapshot {
            name: self.config.name.clone(),
            routing_key: self.config.routing_key.clone(),
            kind: self.config.kind,
            base_url: self.config.base_url.clone(),
            priority: self.config.priority,
            healthy: stats.healthy,
            overloaded: stats.overloaded,
            latency_ms: stats.last_latency.map(|d| d.as_millis() as u64),
            performance_score: stats.performance_score,
            success_rate: stats.success_rate,
            last_checked: stats.last_checked,
        }
    }
}

/// All configured nodes. Nodes are never removed, only marked unhealthy.
pub struct NodeRegistry {
    nodes: Vec<Arc<BackendNode>>,
}

impl NodeRegistry {
    pub fn new(nodes: Vec<Arc<BackendNode>>) -> Self {
        Self { nodes }
    }

    /// Build clients for every configured node, sharing one HTTP client.
    pub fn from_config(nodes: &[NodeConfig], client: Client) -> Self {
        Self::new(
            nodes
                .iter()
                .map(|node| {
                    Arc::new(BackendNode::new(
                        node.clone(),
                        build_backend(node, client.clone()),
                    ))
                })
                .collect(),
        )
    }

    pub fn nodes(&self) -> &[Arc<BackendNode>] {
        &self.nodes
    }

    pub fn get(&self, routing_key: &str) -> Option<Arc<BackendNode>> {
        self.nodes
            .iter()
            .find(|n| n.routing_key() == routing_key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn snapshots(&self) -> Vec<NodeSnapshot> {
        self.nodes.iter().map(|n| n.snapshot()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> BackendNode {
        let config = NodeConfig::new("studio", "http://localhost:11435", "mlx_studio", NodeKind::Accelerator);
        let backend = build_backend(&config, Client::new());
        BackendNode::new(config, backend)
    }

    #[test]
    fn test_new_nodes_start_unhealthy_with_default_scores() {
        let stats = node().stats();
        assert!(!stats.healthy);
        assert_eq!(stats.success_rate, 0.9);
        assert_eq!(stats.performance_score, 0.8);
    }

    #[test]
    fn test_probe_updates_health() {
        let node = node();
        node.record_probe(Some(&NodeHealth {
            latency: Duration::from_millis(40),
            overloaded: true,
            report: None,
        }));
        let snapshot = node.snapshot();
        assert!(snapshot.healthy);
        assert!(snapshot.overloaded);
        assert_eq!(snapshot.latency_ms, Some(40));

        node.record_probe(None);
        assert!(!node.stats().healthy);
    }

    #[test]
    fn test_outcomes_move_averages() {
        let node = node();
        node.record_outcome(false, Duration::from_secs(10), Duration::from_secs(60));
        let stats = node.stats();
        assert!((stats.success_rate - 0.72).abs() < 1e-9);
        assert!((stats.performance_score - 0.64).abs() < 1e-9);

        node.record_outcome(true, Duration::ZERO, Duration::from_secs(60));
        let stats = node.stats();
        assert!((stats.success_rate - 0.776).abs() < 1e-9);
        assert!((stats.performance_score - 0.712).abs() < 1e-9);
    }

    #[test]
    fn test_lookup_by_routing_key() {
        let registry = NodeRegistry::from_config(&crate::config::Config::default().nodes, Client::new());
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("local_mac").unwrap().kind(), NodeKind::General);
        assert!(registry.get("cloud").is_none());
    }
}
