//! Integration tests for the model server HTTP API, driven in-process against
//! the synthetic engine.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use inference_common::{CostProfile, GenerateResponse, HealthReport, TagsResponse};
use model_server::app;
use model_server::config::{Config, EngineKind};
use model_server::memory::FixedMemory;
use model_server::state::{build_engine, AppState};
use serde_json::{json, Value};
use tokio::time::{Duration, Instant};
use tower::ServiceExt;

fn test_config() -> Config {
    let mut config = Config::default();
    config.engine.kind = EngineKind::Synthetic;
    config.models.preload.clear();
    for key in ["fast", "coding", "reasoning", "default"] {
        config
            .models
            .profiles
            .insert(key.to_string(), CostProfile::new(1.0, 1.0, 1.0));
    }
    config
}

async fn test_state(config: Config, memory: Arc<FixedMemory>) -> Arc<AppState> {
    let engine = build_engine(&config);
    let state = Arc::new(AppState::new(config, engine, memory));
    state.refresh_models().await.unwrap();
    state
}

async fn test_app(config: Config) -> (Router, Arc<AppState>) {
    let state = test_state(config, Arc::new(FixedMemory::new(40.0, 64.0))).await;
    (app(state.clone()), state)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _) = test_app(test_config()).await;

    for uri in ["/health", "/"] {
        let response = app.clone().oneshot(get(uri)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let report: HealthReport = body_json(response).await;
        assert_eq!(report.status, "healthy");
        assert_eq!(report.max_concurrent, 5);
        assert_eq!(report.active_requests, 0);
        assert!(report.cached_models.is_empty());
        assert!(report.available_models.contains(&"fast".to_string()));
    }
}

#[tokio::test(start_paused = true)]
async fn test_generate_fast_model() {
    let (app, state) = test_app(test_config()).await;

    let started = Instant::now();
    let response = app
        .oneshot(post_json(
            "/api/generate",
            json!({"model": "fast", "prompt": "hello", "maxTokens": 10}),
        ))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(response.status(), StatusCode::OK);
    let body: GenerateResponse = body_json(response).await;
    assert!(body.done);
    assert!(!body.response.is_empty());
    assert_ne!(body.response, "hello");
    // 1s load + 10 tokens at 1s per 1k.
    assert!(elapsed < Duration::from_secs_f64(1.0 + 0.01 + 0.5));

    let info = state.cache.model_info("fast").unwrap();
    assert_eq!(info.use_count, 1);
    assert_eq!(info.active_requests, 0);
}

#[tokio::test(start_paused = true)]
async fn test_generate_by_category() {
    let (app, state) = test_app(test_config()).await;

    let response = app
        .oneshot(post_json(
            "/api/generate",
            json!({"prompt": "write a parser", "category": "code", "max_tokens": 20}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: GenerateResponse = body_json(response).await;
    assert_eq!(body.model, "coding");
    assert!(state.cache.is_resident("coding"));
}

#[tokio::test(start_paused = true)]
async fn test_generate_stream_is_ndjson() {
    let (app, state) = test_app(test_config()).await;

    let response = app
        .oneshot(post_json(
            "/api/generate",
            json!({"model": "fast", "prompt": "hello", "max_tokens": 10, "stream": true}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/x-ndjson"
    );

    let bytes = body_bytes(response).await;
    let lines: Vec<Value> = String::from_utf8(bytes)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();

    assert!(lines.len() >= 2);
    let (last, pieces) = lines.split_last().unwrap();
    assert_eq!(last["done"], true);
    assert!(pieces.iter().all(|p| p["done"] == false));
    let text: String = pieces
        .iter()
        .map(|p| p["response"].as_str().unwrap())
        .collect();
    assert!(!text.is_empty());

    assert_eq!(state.admission.active(), 0);
    assert_eq!(state.cache.model_info("fast").unwrap().active_requests, 0);
}

#[tokio::test(start_paused = true)]
async fn test_chat() {
    let (app, _) = test_app(test_config()).await;

    let response = app
        .oneshot(post_json(
            "/api/chat",
            json!({
                "model": "fast",
                "messages": [
                    {"role": "system", "content": "Be brief."},
                    {"role": "user", "content": "Hi there"}
                ],
                "options": {"num_predict": 16}
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = body_json(response).await;
    assert_eq!(body["model"], "fast");
    assert_eq!(body["message"]["role"], "assistant");
    assert_eq!(body["done"], true);
    assert!(!body["message"]["content"].as_str().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_admission_bounds_concurrency() {
    let mut config = test_config();
    config.admission.max_concurrent = 2;
    let (app, state) = test_app(config).await;
    let max_wait = state.admission.max_wait();

    let monitor_state = state.clone();
    let monitor = tokio::spawn(async move {
        let mut peak = 0;
        for _ in 0..200 {
            peak = peak.max(monitor_state.admission.active());
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        peak
    });

    let mut tasks = Vec::new();
    for i in 0..5 {
        let app = app.clone();
        tasks.push(tokio::spawn(async move {
            let mut request = post_json(
                "/api/generate",
                json!({"model": "fast", "prompt": format!("request {}", i), "max_tokens": 1000}),
            );
            request
                .headers_mut()
                .insert("x-request-priority", "high".parse().unwrap());
            let started = Instant::now();
            let response = app.oneshot(request).await.unwrap();
            (response.status(), started.elapsed())
        }));
    }

    for task in tasks {
        let (status, elapsed) = task.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert!(elapsed <= max_wait);
    }
    assert_eq!(monitor.await.unwrap(), 2);

    let stats: Value = body_json(app.oneshot(get("/queue/stats")).await.unwrap()).await;
    assert_eq!(stats["processed"], 5);
    assert_eq!(stats["active"], 0);
    assert_eq!(stats["queued"], 0);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_rejects_and_spares_health() {
    let mut config = test_config();
    config.admission.rate_limit_max = 2;
    let (app, _) = test_app(config).await;

    let request = || {
        let mut r = post_json("/api/generate", json!({"model": "fast", "prompt": "hi", "max_tokens": 5}));
        r.headers_mut()
            .insert("x-client-id", "batch-job".parse().unwrap());
        r
    };

    for _ in 0..2 {
        let response = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = app.clone().oneshot(request()).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key(header::RETRY_AFTER));
    let body: Value = body_json(response).await;
    assert_eq!(body["error"]["type"], "rate_limited");

    for _ in 0..5 {
        let response = app.clone().oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

#[tokio::test(start_paused = true)]
async fn test_critical_memory_rejects_load() {
    let memory = Arc::new(FixedMemory::new(97.0, 2.0));
    let state = test_state(test_config(), memory).await;
    let app = app(state.clone());

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/generate",
            json!({"model": "reasoning", "prompt": "think", "max_tokens": 10}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = body_json(response).await;
    assert_eq!(body["error"]["type"], "resource_exhausted");

    // The process keeps answering.
    let report: HealthReport = body_json(app.oneshot(get("/health")).await.unwrap()).await;
    assert_eq!(report.status, "degraded");
    assert!(report.cached_models.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_high_memory_evicts_down_to_one() {
    let memory = Arc::new(FixedMemory::new(40.0, 64.0));
    let state = test_state(test_config(), memory.clone()).await;
    let app = app(state.clone());

    for model in ["fast", "coding"] {
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/generate",
                json!({"model": model, "prompt": "warm up", "max_tokens": 10}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(state.cache.resident_count(), 2);
    tokio::time::advance(Duration::from_secs(31)).await;

    memory.set_used_percent(97.0);
    let response = app
        .oneshot(post_json(
            "/api/generate",
            json!({"model": "reasoning", "prompt": "think", "max_tokens": 10}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = body_json(response).await;
    assert_eq!(body["error"]["type"], "resource_exhausted");
    assert!(state.cache.resident_count() <= 1);
    assert!(!state.cache.is_resident("reasoning"));
}

#[tokio::test]
async fn test_tags_and_model_status() {
    let (app, _) = test_app(test_config()).await;

    let response = app.clone().oneshot(get("/api/tags")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let tags: TagsResponse = body_json(response).await;
    let mut names = tags.names();
    names.sort();
    assert_eq!(names, vec!["coding", "default", "fast", "reasoning"]);

    let response = app.oneshot(get("/api/models/fast")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let status: Value = body_json(response).await;
    assert_eq!(status["resolved"], "fast");
    assert_eq!(status["resident"], false);
    assert_eq!(status["profile"]["load_secs"], 1.0);
}

#[tokio::test]
async fn test_empty_prompt_is_bad_request() {
    let (app, _) = test_app(test_config()).await;
    let response = app
        .oneshot(post_json("/api/generate", json!({"model": "fast", "prompt": "  "})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
