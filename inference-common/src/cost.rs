//! Per-model time estimates used to size timeouts.
//!
//! Every model key maps to a load time, an inference rate and a safety margin.
//! The timeout of a request is `load + tokens/1000 * inference + margin`, where the
//! load term is the measured load time when the model is already resident.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tokens assumed when computing the worst-case queue wait.
pub const QUEUE_WAIT_TOKENS: u32 = 2048;

/// Lower bound of the computed queue wait, in seconds.
pub const QUEUE_WAIT_FLOOR_SECS: f64 = 300.0;

/// Default lower bound of any per-request timeout, in seconds.
pub const DEFAULT_MIN_TIMEOUT_SECS: f64 = 60.0;

/// Time estimate for one model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostProfile {
    pub load_secs: f64,
    pub inference_secs_per_1k: f64,
    pub margin_secs: f64,
}

impl CostProfile {
    pub const fn new(load_secs: f64, inference_secs_per_1k: f64, margin_secs: f64) -> Self {
        Self {
            load_secs,
            inference_secs_per_1k,
            margin_secs,
        }
    }
}

const DEFAULT_PROFILE: CostProfile = CostProfile::new(60.0, 40.0, 60.0);
const PROFILE_104B: CostProfile = CostProfile::new(180.0, 180.0, 120.0);
const PROFILE_70B: CostProfile = CostProfile::new(120.0, 120.0, 120.0);
const PROFILE_32B: CostProfile = CostProfile::new(60.0, 40.0, 60.0);
const PROFILE_3B: CostProfile = CostProfile::new(25.0, 15.0, 30.0);
const PROFILE_1B: CostProfile = CostProfile::new(10.0, 5.0, 20.0);

/// Built-in estimates, keyed by model name or category alias.
const BUILTIN_PROFILES: &[(&str, CostProfile)] = &[
    ("default", DEFAULT_PROFILE),
    ("command-r-plus:104b", PROFILE_104B),
    ("deepseek-r1-distill-llama:70b", PROFILE_70B),
    ("llama3.3:70b", PROFILE_70B),
    ("reasoning", PROFILE_70B),
    ("qwen2.5-coder:32b", PROFILE_32B),
    ("coding", PROFILE_32B),
    ("phi3.5:3.8b", PROFILE_3B),
    ("phi3:mini-4k", PROFILE_3B),
    ("fast", PROFILE_3B),
    ("qwen2.5:3b", CostProfile::new(20.0, 12.0, 25.0)),
    ("qwen_3b", CostProfile::new(20.0, 12.0, 25.0)),
    ("tinyllama:1.1b-chat", PROFILE_1B),
    ("tiny", PROFILE_1B),
];

/// Table of cost profiles with size-based inference for unknown keys.
#[derive(Debug, Clone)]
pub struct CostModel {
    profiles: HashMap<String, CostProfile>,
    min_timeout_secs: f64,
    queue_wait_override: Option<f64>,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            profiles: BUILTIN_PROFILES
                .iter()
                .map(|(k, p)| (k.to_string(), *p))
                .collect(),
            min_timeout_secs: DEFAULT_MIN_TIMEOUT_SECS,
            queue_wait_override: None,
        }
    }
}

impl CostModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the profile of one key.
    pub fn with_profile(mut self, key: impl Into<String>, profile: CostProfile) -> Self {
        self.profiles.insert(key.into(), profile);
        self
    }

    /// Set the lower bound of every timeout (0 disables it).
    pub fn with_min_timeout(mut self, secs: f64) -> Self {
        self.min_timeout_secs = secs.max(0.0);
        self
    }

    /// Pin the queue wait instead of deriving it from the profiles.
    pub fn with_queue_wait(mut self, secs: Option<f64>) -> Self {
        self.queue_wait_override = secs;
        self
    }

    /// Look up a profile: exact key, then size hints in the name, then the default.
    pub fn profile(&self, model_key: &str) -> CostProfile {
        if let Some(profile) = self.profiles.get(model_key) {
            return *profile;
        }
        size_profile(model_key).unwrap_or_else(|| {
            self.profiles
                .get("default")
                .copied()
                .unwrap_or(DEFAULT_PROFILE)
        })
    }

    /// Full request timeout for `max_tokens` tokens on `model_key`.
    ///
    /// `measured_load` replaces the estimated load time when the model's actual
    /// load duration is known.
    pub fn timeout(&self, model_key: &str, max_tokens: u32, measured_load: Option<f64>) -> Duration {
        Duration::from_secs_f64(self.timeout_secs(model_key, max_tokens, measured_load))
    }

    pub fn timeout_secs(&self, model_key: &str, max_tokens: u32, measured_load: Option<f64>) -> f64 {
        let profile = self.profile(model_key);
        let load = measured_load.unwrap_or(profile.load_secs);
        let inference = (max_tokens as f64 / 1000.0) * profile.inference_secs_per_1k;
        (load + inference + profile.margin_secs).max(self.min_timeout_secs)
    }

    /// Estimated time for a cold load plus margin; bounds waits on someone else's load.
    pub fn load_wait(&self, model_key: &str) -> Duration {
        let profile = self.profile(model_key);
        Duration::from_secs_f64(
            (profile.load_secs + profile.margin_secs).max(self.min_timeout_secs),
        )
    }

    /// Longest time a request may wait for an admission slot.
    pub fn max_queue_wait(&self) -> Duration {
        if let Some(secs) = self.queue_wait_override {
            return Duration::from_secs_f64(secs.max(0.0));
        }
        let worst = self
            .profiles
            .keys()
            .map(|key| self.timeout_secs(key, QUEUE_WAIT_TOKENS, None))
            .fold(QUEUE_WAIT_FLOOR_SECS, f64::max);
        Duration::from_secs_f64(worst)
    }
}

/// Infer a profile from parameter-count hints in a model name.
fn size_profile(model_key: &str) -> Option<CostProfile> {
    let key = model_key.to_ascii_lowercase();
    if key.contains("104") {
        Some(PROFILE_104B)
    } else if key.contains("70") {
        Some(PROFILE_70B)
    } else if key.contains("32") {
        Some(PROFILE_32B)
    } else if key.contains("3b") || key.contains("3.8") || key.contains("4k") {
        Some(PROFILE_3B)
    } else if key.contains("1b") || key.contains("1.1") {
        Some(PROFILE_1B)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("qwen2.5-coder:32b", 60.0, 40.0)]
    #[case("fast", 25.0, 15.0)]
    #[case("mixtral:70b-instruct", 120.0, 120.0)]
    #[case("some-104b-model", 180.0, 180.0)]
    #[case("gemma:1b", 10.0, 5.0)]
    #[case("llama3.2:3b", 25.0, 15.0)]
    #[case("unknown-model", 60.0, 40.0)]
    fn test_profile_lookup(#[case] key: &str, #[case] load: f64, #[case] per_1k: f64) {
        let profile = CostModel::new().profile(key);
        assert_eq!(profile.load_secs, load);
        assert_eq!(profile.inference_secs_per_1k, per_1k);
    }

    #[test]
    fn test_timeout_formula() {
        let model = CostModel::new().with_min_timeout(0.0);
        // 25 + 2 * 15 + 30
        assert_eq!(model.timeout_secs("fast", 2000, None), 85.0);
        // measured load replaces the estimate
        assert_eq!(model.timeout_secs("fast", 2000, Some(5.0)), 65.0);
    }

    #[test]
    fn test_timeout_minimum() {
        let model = CostModel::new()
            .with_profile("fast", CostProfile::new(1.0, 1.0, 2.0));
        assert_eq!(model.timeout_secs("fast", 10, None), 60.0);

        let model = model.with_min_timeout(0.0);
        assert!((model.timeout_secs("fast", 10, None) - 3.01).abs() < 1e-9);
    }

    #[test]
    fn test_max_queue_wait_is_worst_case() {
        let model = CostModel::new();
        // 104b: 180 + 2.048 * 180 + 120
        let expected = 180.0 + 2.048 * 180.0 + 120.0;
        assert!((model.max_queue_wait().as_secs_f64() - expected).abs() < 1e-6);
    }

    #[test]
    fn test_max_queue_wait_floor_and_override() {
        let small = CostModel {
            profiles: HashMap::from([("tiny".to_string(), PROFILE_1B)]),
            min_timeout_secs: 0.0,
            queue_wait_override: None,
        };
        assert_eq!(small.max_queue_wait(), Duration::from_secs(300));

        let pinned = CostModel::new().with_queue_wait(Some(12.0));
        assert_eq!(pinned.max_queue_wait(), Duration::from_secs(12));
    }
}
