//! Gateway configuration.

use std::collections::HashMap;
use std::collections::HashSet;

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use inference_common::{CostModel, CostProfile, Priority};
use serde::Deserialize;

/// Main configuration structure for the gateway.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    /// Backend nodes, in configuration order.
    #[serde(default = "default_nodes")]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub breakers: BreakersConfig,
    #[serde(default)]
    pub cache: ResponseCacheConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub models: ModelsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            nodes: default_nodes(),
            routing: RoutingConfig::default(),
            breakers: BreakersConfig::default(),
            cache: ResponseCacheConfig::default(),
            audit: AuditConfig::default(),
            models: ModelsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Backend class. Each class has its own model catalog, cost profile and breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// A model server with admission control and self-reported load.
    Accelerator,
    /// A plain Ollama daemon; the only class that serves vision models.
    General,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Accelerator => "accelerator",
            NodeKind::General => "general",
        }
    }
}

/// One backend node.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NodeConfig {
    /// Human-readable name.
    pub name: String,
    pub base_url: String,
    /// Reported as the completion source and recorded in routing decisions.
    pub routing_key: String,
    pub kind: NodeKind,
    /// Static priority; lower is preferred when scores tie.
    #[serde(default)]
    pub priority: u32,
}

impl NodeConfig {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        routing_key: impl Into<String>,
        kind: NodeKind,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            routing_key: routing_key.into(),
            kind,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    /// How long a non-empty healthy-node list is reused.
    #[serde(default = "default_health_ttl")]
    pub health_ttl_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: f64,
    /// How long an accelerator's overload flag is trusted before its
    /// `/health` is read again, independent of `health_ttl_secs`.
    #[serde(default = "default_overload_ttl")]
    pub overload_ttl_secs: u64,
    /// How long a node's live model list is reused.
    #[serde(default = "default_catalog_ttl")]
    pub catalog_ttl_secs: u64,
    /// Extra attempts per node after the first one.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backoff before retry `n` is `backoff_base_secs * 2^n`.
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Share of requests that consult the learned predictor.
    #[serde(default = "default_learned_ratio")]
    pub learned_ratio: f64,
    /// Predictions at or below this confidence are ignored.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    /// Interval between predictor refreshes from the audit store (0 disables them).
    #[serde(default = "default_predictor_refresh")]
    pub predictor_refresh_secs: u64,
    /// Priority sent to backends when the caller gives none.
    #[serde(default = "default_priority")]
    pub default_priority: Priority,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            health_ttl_secs: default_health_ttl(),
            probe_timeout_secs: default_probe_timeout(),
            overload_ttl_secs: default_overload_ttl(),
            catalog_ttl_secs: default_catalog_ttl(),
            max_retries: default_max_retries(),
            backoff_base_secs: default_backoff_base(),
            max_tokens: default_max_tokens(),
            learned_ratio: default_learned_ratio(),
            confidence_threshold: default_confidence_threshold(),
            predictor_refresh_secs: default_predictor_refresh(),
            default_priority: default_priority(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds the circuit stays open before one trial call is let through.
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_secs: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout(),
        }
    }
}

/// One breaker per dependency.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BreakersConfig {
    #[serde(default)]
    pub db: BreakerConfig,
    #[serde(default)]
    pub accelerator: BreakerConfig,
    #[serde(default)]
    pub general: BreakerConfig,
    #[serde(default)]
    pub cloud: BreakerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseCacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,
    /// Longer prompts are never cached.
    #[serde(default = "default_cache_prompt_chars")]
    pub max_prompt_chars: usize,
    /// Responses this long or longer are never cached.
    #[serde(default = "default_cache_response_chars")]
    pub max_response_chars: usize,
}

impl Default for ResponseCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_cache_ttl(),
            max_entries: default_cache_entries(),
            max_prompt_chars: default_cache_prompt_chars(),
            max_response_chars: default_cache_response_chars(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// SQLite database URL
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Decisions buffered for the writer before new ones are dropped.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            database_url: default_database_url(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Cost profiles used to size per-node dispatch timeouts.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    #[serde(default)]
    pub profiles: HashMap<String, CostProfile>,
    #[serde(default = "default_min_timeout")]
    pub min_timeout_secs: f64,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            profiles: HashMap::new(),
            min_timeout_secs: default_min_timeout(),
        }
    }
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_nodes() -> Vec<NodeConfig> {
    vec![
        NodeConfig::new(
            "Mac Studio (MLX)",
            "http://localhost:11435",
            "mlx_studio",
            NodeKind::Accelerator,
        ),
        NodeConfig::new(
            "MacBook (Ollama)",
            "http://localhost:11434",
            "local_mac",
            NodeKind::General,
        ),
    ]
}
fn default_health_ttl() -> u64 {
    120
}
fn default_probe_timeout() -> f64 {
    2.0
}
fn default_overload_ttl() -> u64 {
    5
}
fn default_catalog_ttl() -> u64 {
    120
}
fn default_max_retries() -> u32 {
    2
}
fn default_backoff_base() -> f64 {
    1.0
}
fn default_max_tokens() -> u32 {
    inference_common::DEFAULT_NUM_PREDICT
}
fn default_learned_ratio() -> f64 {
    0.5
}
fn default_confidence_threshold() -> f64 {
    0.7
}
fn default_predictor_refresh() -> u64 {
    300
}
fn default_priority() -> Priority {
    Priority::High
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_recovery_timeout() -> f64 {
    60.0
}
fn default_true() -> bool {
    true
}
fn default_cache_ttl() -> u64 {
    1800
}
fn default_cache_entries() -> usize {
    500
}
fn default_cache_prompt_chars() -> usize {
    1000
}
fn default_cache_response_chars() -> usize {
    5000
}
fn default_database_url() -> String {
    "sqlite:./data/routing.db".to_string()
}
fn default_channel_capacity() -> usize {
    1024
}
fn default_min_timeout() -> f64 {
    inference_common::cost::DEFAULT_MIN_TIMEOUT_SECS
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (GATEWAY__SECTION__KEY format)
    /// 2. gateway.toml file (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .set_default("server.port", default_port() as i64)?
            .add_source(File::with_name("gateway").required(false))
            .add_source(
                Environment::with_prefix("GATEWAY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that cannot work instead of coercing them.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut keys = HashSet::new();
        for node in &self.nodes {
            if node.base_url.trim().is_empty() {
                return Err(ConfigError::Message(format!(
                    "node {} has an empty base_url",
                    node.name
                )));
            }
            if !keys.insert(node.routing_key.as_str()) {
                return Err(ConfigError::Message(format!(
                    "duplicate routing_key {}",
                    node.routing_key
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.routing.learned_ratio) {
            return Err(ConfigError::Message(format!(
                "routing.learned_ratio must be within 0..=1, got {}",
                self.routing.learned_ratio
            )));
        }
        for (name, breaker) in self.breakers.named() {
            if breaker.failure_threshold == 0 {
                return Err(ConfigError::Message(format!(
                    "breakers.{}.failure_threshold must be at least 1",
                    name
                )));
            }
        }
        if self.audit.channel_capacity == 0 {
            return Err(ConfigError::Message(
                "audit.channel_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the cost model from the built-in table plus configured overrides.
    pub fn cost_model(&self) -> CostModel {
        self.models
            .profiles
            .iter()
            .fold(CostModel::new(), |model, (key, profile)| {
                model.with_profile(key.clone(), *profile)
            })
            .with_min_timeout(self.models.min_timeout_secs)
    }
}

impl BreakersConfig {
    pub fn named(&self) -> [(&'static str, BreakerConfig); 4] {
        [
            ("db", self.db),
            ("accelerator", self.accelerator),
            ("general", self.general),
            ("cloud", self.cloud),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_describe_two_class_deployment() {
        let config = Config::default();
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.nodes[0].routing_key, "mlx_studio");
        assert_eq!(config.nodes[0].kind, NodeKind::Accelerator);
        assert_eq!(config.nodes[1].routing_key, "local_mac");
        assert_eq!(config.routing.health_ttl_secs, 120);
        assert_eq!(config.routing.overload_ttl_secs, 5);
        assert_eq!(config.routing.max_retries, 2);
        assert_eq!(config.routing.default_priority, Priority::High);
        assert_eq!(config.breakers.cloud.failure_threshold, 5);
        assert_eq!(config.cache.max_entries, 500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duplicate_routing_keys_rejected() {
        let mut config = Config::default();
        config.nodes[1].routing_key = "mlx_studio".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_node_table_deserializes() {
        let raw = r#"
            [[nodes]]
            name = "studio"
            base_url = "http://10.0.0.2:11435"
            routing_key = "studio"
            kind = "accelerator"

            [[nodes]]
            name = "laptop"
            base_url = "http://10.0.0.3:11434"
            routing_key = "laptop"
            kind = "general"
            priority = 1

            [breakers.db]
            failure_threshold = 3
        "#;
        let config: Config = ConfigLoader::builder()
            .add_source(File::from_str(raw, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.nodes[1].priority, 1);
        assert_eq!(config.breakers.db.failure_threshold, 3);
        assert_eq!(config.breakers.db.recovery_timeout_secs, 60.0);
        assert_eq!(config.routing.catalog_ttl_secs, 120);
    }
}
