//! Inference router: node ordering, model choice, retries and failover.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use inference_common::{CostModel, Priority};
use serde_json::json;

use crate::audit::{AuditSink, RoutingDecision, FALLBACK_ROUTE};
use crate::backend::GenerationCall;
use crate::breaker::Breakers;
use crate::cache::ResponseCache;
use crate::catalog::ModelCatalog;
use crate::classify::{Classification, ComplexityClass};
use crate::config::{Config, NodeKind};
use crate::echo::is_echo;
use crate::facade::{Completion, GenerateOptions};
use crate::health::HealthProbe;
use crate::predictor::{AbSwitch, Prediction, RoutePredictor};
use crate::registry::{BackendNode, NodeRegistry};
use crate::retry::RetryPolicy;

/// A successful dispatch to one node.
#[derive(Debug)]
struct Dispatched {
    text: String,
    attempt: u32,
    elapsed: Duration,
}

/// Order healthy nodes for one request.
///
/// `healthy` must already be sorted best first. Image requests only go to
/// general nodes. While an accelerator reports overload every request starts
/// on the general nodes. Otherwise the two classes are interleaved, heavy
/// requests starting on the accelerator and light requests alternating by
/// `rotation`. A confident prediction moves its node to the front.
pub fn order_candidates(
    healthy: &[Arc<BackendNode>],
    complexity: ComplexityClass,
    vision_only: bool,
    rotation: usize,
    prediction: Option<&Prediction>,
    confidence_threshold: f64,
) -> Vec<Arc<BackendNode>> {
    let eligible: Vec<Arc<BackendNode>> = healthy
        .iter()
        .filter(|node| !vision_only || node.kind() == NodeKind::General)
        .cloned()
        .collect();

    let (accelerators, general): (Vec<_>, Vec<_>) = eligible
        .iter()
        .cloned()
        .partition(|node| node.kind() == NodeKind::Accelerator);

    let mut ordered = if accelerators.is_empty() || general.is_empty() {
        eligible
    } else if accelerators.iter().any(|node| node.is_overloaded()) {
        general.into_iter().chain(accelerators).collect()
    } else if complexity == ComplexityClass::Light && rotation % 2 == 1 {
        interleave(general, accelerators)
    } else {
        interleave(accelerators, general)
    };

    if let Some(prediction) = prediction.filter(|p| p.confidence > confidence_threshold) {
        if let Some(pos) = ordered
            .iter()
            .position(|node| node.routing_key() == prediction.route)
        {
            let node = ordered.remove(pos);
            ordered.insert(0, node);
        }
    }
    ordered
}

fn interleave<T>(first: Vec<T>, second: Vec<T>) -> Vec<T> {
    let mut out = Vec::with_capacity(first.len() + second.len());
    let mut first = first.into_iter();
    let mut second = second.into_iter();
    loop {
        match (first.next(), second.next()) {
            (None, None) => return out,
            (a, b) => out.extend(a.into_iter().chain(b)),
        }
    }
}

/// Routes generation requests across the local nodes.
pub struct InferenceRouter {
    health: HealthProbe,
    catalog: ModelCatalog,
    breakers: Breakers,
    cache: ResponseCache,
    audit: AuditSink,
    predictor: Option<Arc<dyn RoutePredictor>>,
    ab: AbSwitch,
    confidence_threshold: f64,
    retry: RetryPolicy,
    cost: CostModel,
    max_tokens: u32,
    default_priority: Priority,
    rotation: AtomicUsize,
}

impl InferenceRouter {
    pub fn new(
        config: &Config,
        registry: Arc<NodeRegistry>,
        breakers: Breakers,
        audit: AuditSink,
    ) -> Self {
        let routing = &config.routing;
        let probe_timeout = Duration::from_secs_f64(routing.probe_timeout_secs.max(0.0));
        Self {
            health: HealthProbe::new(
                registry,
                Duration::from_secs(routing.health_ttl_secs),
                probe_timeout,
            )
            .with_overload_ttl(Duration::from_secs(routing.overload_ttl_secs)),
            catalog: ModelCatalog::new(Duration::from_secs(routing.catalog_ttl_secs), probe_timeout),
            breakers,
            cache: ResponseCache::new(config.cache.clone()),
            audit,
            predictor: None,
            ab: AbSwitch::new(routing.learned_ratio),
            confidence_threshold: routing.confidence_threshold,
            retry: RetryPolicy::from_config(routing),
            cost: config.cost_model(),
            max_tokens: routing.max_tokens,
            default_priority: routing.default_priority,
            rotation: AtomicUsize::new(0),
        }
    }

    /// Consult `predictor` for the share of requests the A/B switch selects.
    pub fn with_predictor(mut self, predictor: Arc<dyn RoutePredictor>) -> Self {
        self.predictor = Some(predictor);
        self
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        self.health.registry()
    }

    pub fn health(&self) -> &HealthProbe {
        &self.health
    }

    pub fn breakers(&self) -> &Breakers {
        &self.breakers
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn audit(&self) -> &AuditSink {
        &self.audit
    }

    /// Serve `prompt` from the cache or the best available node.
    ///
    /// Returns `None` when no node produced a usable answer; a fallback
    /// decision is recorded in that case.
    pub async fn route(&self, prompt: &str, opts: &GenerateOptions) -> Option<Completion> {
        let started = Instant::now();
        let images = opts.images.as_deref().filter(|images| !images.is_empty());
        let has_images = images.is_some();
        let category = opts.category.as_deref();
        let class = Classification::of(prompt, category, has_images);
        let prompt_length = prompt.chars().count();

        let cache_key = self.cache.key(
            prompt,
            category,
            Some(opts.model.as_deref().unwrap_or(class.slot.as_str())),
            has_images,
        );
        if let Some(hit) = cache_key.as_deref().and_then(|key| self.cache.get(key)) {
            return Some(hit);
        }

        let healthy = self.health.healthy_nodes(false).await;
        if healthy.is_empty() {
            self.record_fallback(&class, prompt_length, category, started, "no_healthy_nodes");
            return None;
        }

        let prediction = match &self.predictor {
            Some(predictor) if self.ab.use_learned() => {
                let keys: Vec<&str> = healthy.iter().map(|node| node.routing_key()).collect();
                predictor.predict(class.task_type, prompt_length, &keys)
            }
            _ => None,
        };
        let candidates = order_candidates(
            &healthy,
            class.complexity,
            has_images,
            self.rotation.fetch_add(1, Ordering::Relaxed),
            prediction.as_ref(),
            self.confidence_threshold,
        );
        if candidates.is_empty() {
            self.record_fallback(&class, prompt_length, category, started, "no_eligible_nodes");
            return None;
        }

        let priority = opts.priority.unwrap_or(self.default_priority);
        let max_tokens = opts.max_tokens.unwrap_or(self.max_tokens);

        for node in &candidates {
            let model = match opts.model.as_deref() {
                Some(model) => model.to_string(),
                None => {
                    self.catalog
                        .model_for(node.routing_key(), node.kind(), node.backend.as_ref(), class.slot)
                        .await
                }
            };
            let call = GenerationCall {
                model,
                prompt: prompt.to_string(),
                system: opts.system.clone(),
                category: category.map(String::from),
                max_tokens,
                images: images.map(<[String]>::to_vec),
                priority,
            };

            let Some(dispatched) = self.dispatch(node, &call).await else {
                continue;
            };

            tracing::info!(
                node = %node.name(),
                model = %call.model,
                task_type = class.task_type.as_str(),
                attempt = dispatched.attempt,
                latency_ms = dispatched.elapsed.as_millis() as u64,
                "Request served"
            );
            self.audit.record(
                RoutingDecision::new(
                    class.task_type,
                    prompt_length,
                    category,
                    node.routing_key(),
                    true,
                )
                .with_latency(started.elapsed().as_secs_f64() * 1000.0)
                .with_performance(node.stats().performance_score)
                .with_features(json!({
                    "model": call.model,
                    "node_name": node.name(),
                    "node_priority": node.config.priority,
                    "attempt": dispatched.attempt,
                    "complexity": class.complexity,
                    "predicted_route": prediction.as_ref().map(|p| p.route.as_str()),
                })),
            );

            let completion = Completion {
                text: dispatched.text,
                source: node.routing_key().to_string(),
            };
            if let Some(key) = &cache_key {
                self.cache.insert(key.clone(), completion.clone());
            }
            return Some(completion);
        }

        tracing::error!(
            candidates = candidates.len(),
            "All local nodes failed, falling back"
        );
        self.record_fallback(&class, prompt_length, category, started, "all_nodes_failed");
        None
    }

    /// Try one node up to `retry.attempts()` times.
    ///
    /// Transient errors are retried with backoff. Client errors, undecodable
    /// replies, empty text and echoed prompts move on to the next node at once.
    async fn dispatch(&self, node: &BackendNode, call: &GenerationCall) -> Option<Dispatched> {
        let breaker = self.breakers.for_kind(node.kind());
        let budget = self.cost.timeout(&call.model, call.max_tokens, None);
        let attempts = self.retry.attempts();

        for attempt in 0..attempts {
            let permit = match breaker.try_acquire() {
                Ok(permit) => permit,
                Err(remaining) => {
                    tracing::debug!(
                        node = %node.name(),
                        breaker = breaker.name(),
                        retry_in_secs = remaining.as_secs(),
                        "Circuit open, skipping node"
                    );
                    return None;
                }
            };

            let sent = Instant::now();
            let result = node.backend.generate(call, budget).await;
            let elapsed = sent.elapsed();

            match result {
                Ok(text) => {
                    permit.success();
                    if text.trim().is_empty() {
                        tracing::warn!(node = %node.name(), model = %call.model, "Empty response");
                        node.record_outcome(false, elapsed, budget);
                        return None;
                    }
                    if is_echo(&call.prompt, &text) || is_echo(&call.full_prompt(), &text) {
                        tracing::warn!(node = %node.name(), model = %call.model, "Response echoes the prompt");
                        node.record_outcome(false, elapsed, budget);
                        return None;
                    }
                    node.record_outcome(true, elapsed, budget);
                    return Some(Dispatched {
                        text,
                        attempt: attempt + 1,
                        elapsed,
                    });
                }
                Err(e) => {
                    if e.is_dependency_failure() {
                        permit.failure();
                    } else {
                        permit.success();
                    }
                    node.record_outcome(false, elapsed, budget);
                    tracing::warn!(
                        node = %node.name(),
                        model = %call.model,
                        attempt = attempt + 1,
                        attempts,
                        error = %e,
                        "Generation attempt failed"
                    );
                    if !e.is_retryable() {
                        return None;
                    }
                    match self.retry.next_delay(attempt) {
                        Some(delay) => tokio::time::sleep(delay).await,
                        None => break,
                    }
                }
            }
        }

        tracing::warn!(node = %node.name(), attempts, "Node failed, trying next");
        None
    }

    fn record_fallback(
        &self,
        class: &Classification,
        prompt_length: usize,
        category: Option<&str>,
        started: Instant,
        reason: &str,
    ) {
        self.audit.record(
            RoutingDecision::new(
                class.task_type,
                prompt_length,
                category,
                FALLBACK_ROUTE,
                false,
            )
            .with_latency(started.elapsed().as_secs_f64() * 1000.0)
            .with_features(json!({ "reason": reason })),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{build_backend, NodeHealth};
    use crate::config::NodeConfig;
    use reqwest::Client;

    fn node(key: &str, kind: NodeKind) -> Arc<BackendNode> {
        let config = NodeConfig::new(key, format!("http://{}.invalid", key), key, kind);
        let backend = build_backend(&config, Client::new());
        Arc::new(BackendNode::new(config, backend))
    }

    fn keys(nodes: &[Arc<BackendNode>]) -> Vec<&str> {
        nodes.iter().map(|n| n.routing_key()).collect()
    }

    fn overload(node: &BackendNode) {
        node.record_probe(Some(&NodeHealth {
            latency: Duration::from_millis(5),
            overloaded: true,
            report: None,
        }));
    }

    fn fleet() -> Vec<Arc<BackendNode>> {
        vec![
            node("mlx", NodeKind::Accelerator),
            node("mac", NodeKind::General),
            node("mini", NodeKind::General),
        ]
    }

    #[test]
    fn test_heavy_starts_on_accelerator() {
        let healthy = fleet();
        for rotation in 0..2 {
            let ordered =
                order_candidates(&healthy, ComplexityClass::Heavy, false, rotation, None, 0.7);
            assert_eq!(keys(&ordered), ["mlx", "mac", "mini"]);
        }
    }

    #[test]
    fn test_light_alternates_classes() {
        let healthy = fleet();
        let even = order_candidates(&healthy, ComplexityClass::Light, false, 0, None, 0.7);
        let odd = order_candidates(&healthy, ComplexityClass::Light, false, 1, None, 0.7);
        assert_eq!(keys(&even), ["mlx", "mac", "mini"]);
        assert_eq!(keys(&odd), ["mac", "mlx", "mini"]);
    }

    #[test]
    fn test_overloaded_accelerator_goes_last() {
        let healthy = fleet();
        overload(&healthy[0]);
        for complexity in [ComplexityClass::Light, ComplexityClass::Heavy] {
            for rotation in 0..2 {
                let ordered = order_candidates(&healthy, complexity, false, rotation, None, 0.7);
                assert_eq!(keys(&ordered), ["mac", "mini", "mlx"]);
            }
        }
    }

    #[test]
    fn test_images_only_go_to_general_nodes() {
        let ordered = order_candidates(&fleet(), ComplexityClass::Heavy, true, 0, None, 0.7);
        assert_eq!(keys(&ordered), ["mac", "mini"]);

        let accel_only = vec![node("mlx", NodeKind::Accelerator)];
        assert!(order_candidates(&accel_only, ComplexityClass::Light, true, 0, None, 0.7).is_empty());
    }

    #[test]
    fn test_confident_prediction_moves_to_front() {
        let healthy = fleet();
        let confident = Prediction {
            route: "mini".to_string(),
            confidence: 0.9,
        };
        let ordered =
            order_candidates(&healthy, ComplexityClass::Heavy, false, 0, Some(&confident), 0.7);
        assert_eq!(keys(&ordered), ["mini", "mlx", "mac"]);

        let unsure = Prediction {
            route: "mini".to_string(),
            confidence: 0.7,
        };
        let ordered =
            order_candidates(&healthy, ComplexityClass::Heavy, false, 0, Some(&unsure), 0.7);
        assert_eq!(keys(&ordered), ["mlx", "mac", "mini"]);

        let unknown = Prediction {
            route: "cloud".to_string(),
            confidence: 1.0,
        };
        let ordered =
            order_candidates(&healthy, ComplexityClass::Heavy, false, 0, Some(&unknown), 0.7);
        assert_eq!(ordered.len(), 3);
    }

    #[test]
    fn test_single_class_keeps_health_order() {
        let healthy = vec![node("b", NodeKind::General), node("a", NodeKind::General)];
        let ordered = order_candidates(&healthy, ComplexityClass::Light, false, 1, None, 0.7);
        assert_eq!(keys(&ordered), ["b", "a"]);
    }
}
