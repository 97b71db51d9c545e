//! Model server - loads models on demand and serves an Ollama-compatible API.

use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use model_server::config::Config;
use model_server::memory::ProcMemInfo;
use model_server::state::{build_engine, AppState};
use model_server::{app, maintenance};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const GIT_HASH: Option<&str> = option_env!("GIT_HASH");

fn print_version() {
    println!("model-server {} ({})", VERSION, GIT_HASH.unwrap_or("unknown"));
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Handle --version / -V
    let args: Vec<String> = env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        print_version();
        return Ok(());
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load().map_err(|e| format!("Failed to load configuration: {}", e))?;
    tracing::info!(
        "Starting {} with {:?} engine (max_concurrent={}, max_resident={})",
        config.server.name,
        config.engine.kind,
        config.admission.max_concurrent,
        config.cache.max_resident
    );

    let engine = build_engine(&config);
    let state = Arc::new(AppState::new(
        config.clone(),
        engine,
        Arc::new(ProcMemInfo::new()),
    ));

    match state.refresh_models().await {
        Ok(models) => tracing::info!("Engine serves {} model(s): {:?}", models.len(), models),
        Err(e) => tracing::warn!("Could not list engine models yet: {}", e),
    }
    tracing::info!(
        "Admission queue wait limit {:.0}s",
        state.admission.max_wait().as_secs_f64()
    );

    // Preload in the background so the port opens immediately.
    let preload_cache = state.cache.clone();
    let preload_models = config.models.preload.clone();
    tokio::spawn(async move {
        maintenance::preload(&preload_cache, &preload_models).await;
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let cleanup = maintenance::spawn_cleanup(
        state.cache.clone(),
        config.cache.cleanup_interval_secs,
        shutdown_rx,
    );

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutting down");
    })
    .await?;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = cleanup {
        let _ = handle.await;
    }
    Ok(())
}
