//! Configuration for the model server.

use std::collections::HashMap;
use std::env;

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use inference_common::{CostModel, CostProfile};
use serde::Deserialize;

/// Main configuration structure for the model server.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub models: ModelsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Name reported in logs and health output.
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Which runtime actually executes the models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// Forward to an Ollama-compatible daemon.
    #[default]
    Ollama,
    /// Simulated runtime with cost-model shaped latencies.
    Synthetic,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub kind: EngineKind,
    #[serde(default = "default_ollama_url")]
    pub base_url: String,
    /// Models exposed by the synthetic engine.
    #[serde(default = "default_synthetic_models")]
    pub synthetic_models: Vec<String>,
    /// Multiplier applied to synthetic load and inference delays.
    #[serde(default = "default_time_scale")]
    pub time_scale: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::default(),
            base_url: default_ollama_url(),
            synthetic_models: default_synthetic_models(),
            time_scale: default_time_scale(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdmissionConfig {
    /// Generations allowed to run at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Requests allowed to wait for a slot before new ones are turned away.
    #[serde(default = "default_max_queued")]
    pub max_queued: usize,
    /// Fixed slot-wait limit; derived from the cost model when unset.
    #[serde(default)]
    pub queue_wait_secs: Option<f64>,
    #[serde(default = "default_rate_limit_window")]
    pub rate_limit_window_secs: u64,
    #[serde(default = "default_rate_limit_max")]
    pub rate_limit_max: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_queued: default_max_queued(),
            queue_wait_secs: None,
            rate_limit_window_secs: default_rate_limit_window(),
            rate_limit_max: default_rate_limit_max(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of resident models.
    #[serde(default = "default_max_resident")]
    pub max_resident: usize,
    #[serde(default = "default_memory_warning")]
    pub memory_warning_percent: f64,
    #[serde(default = "default_memory_critical")]
    pub memory_critical_percent: f64,
    /// Above this, every unprotected model is evicted.
    #[serde(default = "default_memory_emergency")]
    pub memory_emergency_percent: f64,
    /// Models used more recently than this are never evicted.
    #[serde(default = "default_eviction_grace")]
    pub eviction_grace_secs: u64,
    /// Residents kept by a non-emergency memory reclaim.
    #[serde(default = "default_reclaim_keep")]
    pub reclaim_keep_count: usize,
    /// Loads wait for other models' generations to finish.
    #[serde(default = "default_true")]
    pub serialize_loads: bool,
    #[serde(default = "default_serialization_wait")]
    pub serialization_wait_secs: u64,
    /// Background cleanup period (0 disables it).
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
    /// Unload models idle for longer than this during cleanup (0 disables it).
    #[serde(default = "default_idle_unload")]
    pub idle_unload_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_resident: default_max_resident(),
            memory_warning_percent: default_memory_warning(),
            memory_critical_percent: default_memory_critical(),
            memory_emergency_percent: default_memory_emergency(),
            eviction_grace_secs: default_eviction_grace(),
            reclaim_keep_count: default_reclaim_keep(),
            serialize_loads: true,
            serialization_wait_secs: default_serialization_wait(),
            cleanup_interval_secs: default_cleanup_interval(),
            idle_unload_secs: default_idle_unload(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    /// Models loaded at startup.
    #[serde(default = "default_preload")]
    pub preload: Vec<String>,
    /// Maps foreign model names to local model keys.
    /// Example: { "phi3.5:3.8b" = "fast" }
    #[serde(default)]
    pub aliases: HashMap<String, String>,
    /// Maps category labels to local model keys.
    #[serde(default = "default_categories")]
    pub categories: HashMap<String, String>,
    /// Cost profile overrides, keyed by model key.
    #[serde(default)]
    pub profiles: HashMap<String, CostProfile>,
    #[serde(default = "default_min_timeout")]
    pub min_timeout_secs: f64,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            preload: default_preload(),
            aliases: HashMap::new(),
            categories: default_categories(),
            profiles: HashMap::new(),
            min_timeout_secs: default_min_timeout(),
        }
    }
}

// Default values
fn default_name() -> String {
    "model-server".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    11435
}
fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_synthetic_models() -> Vec<String> {
    vec![
        "fast".to_string(),
        "coding".to_string(),
        "reasoning".to_string(),
        "default".to_string(),
    ]
}
fn default_time_scale() -> f64 {
    1.0
}
fn default_max_concurrent() -> usize {
    5
}
fn default_max_queued() -> usize {
    50
}
fn default_rate_limit_window() -> u64 {
    90
}
fn default_rate_limit_max() -> usize {
    150
}
fn default_max_resident() -> usize {
    2
}
fn default_memory_warning() -> f64 {
    85.0
}
fn default_memory_critical() -> f64 {
    95.0
}
fn default_memory_emergency() -> f64 {
    98.0
}
fn default_eviction_grace() -> u64 {
    30
}
fn default_reclaim_keep() -> usize {
    1
}
fn default_true() -> bool {
    true
}
fn default_serialization_wait() -> u64 {
    120
}
fn default_cleanup_interval() -> u64 {
    600
}
fn default_idle_unload() -> u64 {
    1800
}
fn default_preload() -> Vec<String> {
    vec!["fast".to_string()]
}
fn default_categories() -> HashMap<String, String> {
    [
        ("reasoning", "reasoning"),
        ("coding", "coding"),
        ("code", "coding"),
        ("fast", "fast"),
        ("tiny", "tiny"),
        ("default", "default"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}
fn default_min_timeout() -> f64 {
    inference_common::cost::DEFAULT_MIN_TIMEOUT_SECS
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Legacy flat variables (MLX_MAX_CONCURRENT, ...)
    /// 2. Environment variables (MODEL_SERVER__SECTION__KEY format)
    /// 3. model-server.toml file (if present)
    /// 4. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .set_default("server.port", default_port() as i64)?
            .set_default("admission.max_concurrent", default_max_concurrent() as i64)?
            .set_default("cache.max_resident", default_max_resident() as i64)?
            .add_source(File::with_name("model-server").required(false))
            .add_source(
                Environment::with_prefix("MODEL_SERVER")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("models.preload")
                    .with_list_parse_key("engine.synthetic_models")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = config.try_deserialize()?;
        config.apply_legacy_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the flat `MLX_*` variables older deployments set.
    fn apply_legacy_env(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = legacy_var("MLX_MAX_CONCURRENT")? {
            self.admission.max_concurrent = v;
        }
        if let Some(v) = legacy_var("MLX_RATE_LIMIT_WINDOW")? {
            self.admission.rate_limit_window_secs = v;
        }
        if let Some(v) = legacy_var("MLX_RATE_LIMIT_MAX")? {
            self.admission.rate_limit_max = v;
        }
        if let Some(v) = legacy_var("MLX_QUEUE_WAIT_TIMEOUT")? {
            self.admission.queue_wait_secs = Some(v);
        }
        if let Some(v) = legacy_var("MLX_MAX_CACHED_MODELS")? {
            self.cache.max_resident = v;
        }
        if let Some(v) = legacy_var("MLX_MEMORY_WARNING_PERCENT")? {
            self.cache.memory_warning_percent = v;
        }
        if let Some(v) = legacy_var("MLX_MEMORY_CRITICAL_PERCENT")? {
            self.cache.memory_critical_percent = v;
        }
        if let Some(v) = legacy_var("MLX_CACHE_CLEANUP_INTERVAL_SEC")? {
            self.cache.cleanup_interval_secs = v;
        }
        if let Ok(list) = env::var("MLX_PRELOAD_MODELS") {
            self.models.preload = parse_list(&list);
        }
        Ok(())
    }

    /// Reject values that cannot work instead of coercing them.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.admission.max_concurrent == 0 {
            return Err(ConfigError::Message(
                "admission.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.cache.max_resident == 0 {
            return Err(ConfigError::Message(
                "cache.max_resident must be at least 1".to_string(),
            ));
        }
        let cache = &self.cache;
        if !(cache.memory_warning_percent <= cache.memory_critical_percent
            && cache.memory_critical_percent <= cache.memory_emergency_percent)
        {
            return Err(ConfigError::Message(format!(
                "memory thresholds must be ordered: warning {} <= critical {} <= emergency {}",
                cache.memory_warning_percent,
                cache.memory_critical_percent,
                cache.memory_emergency_percent
            )));
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
            .with_queue_wait(self.admission.queue_wait_secs)
    }
}

fn legacy_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Message(format!("invalid value for {}: {}", name, raw))),
        Err(_) => Ok(None),
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
