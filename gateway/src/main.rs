//! Inference gateway - serves the operational HTTP surface over the router.

use std::env;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use inference_gateway::audit::{AuditSink, AuditStore};
use inference_gateway::breaker::Breakers;
use inference_gateway::predictor::{spawn_refresh, HistoryPredictor};
use inference_gateway::{app, Config, Gateway};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const GIT_HASH: Option<&str> = option_env!("GIT_HASH");

/// Audit history the route predictor learns from.
const PREDICTOR_WINDOW_HOURS: i64 = 24;

fn print_version() {
    println!("inference-gateway {} ({})", VERSION, GIT_HASH.unwrap_or("unknown"));
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
    for node in &config.nodes {
        tracing::info!(
            "Node {} ({}) at {} as {}",
            node.name,
            node.kind.as_str(),
            node.base_url,
            node.routing_key
        );
    }

    let breakers = Breakers::new(&config.breakers);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // The audit trail is optional: without a store, routing still works.
    let store = if config.audit.enabled {
        match AuditStore::new(&config.audit.database_url) {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                tracing::warn!("Routing audit disabled: {}", e);
                None
            }
        }
    } else {
        None
    };

    let (audit, writer) = match &store {
        Some(store) => {
            let (sink, handle) = AuditSink::spawn(
                store.clone(),
                breakers.db.clone(),
                config.audit.channel_capacity,
            );
            (sink, Some(handle))
        }
        None => (AuditSink::disabled(), None),
    };

    let mut gateway = Gateway::from_config(&config, breakers.clone(), audit);
    let mut refresher = None;
    if let Some(store) = &store {
        let predictor = Arc::new(HistoryPredictor::new(chrono::Duration::hours(
            PREDICTOR_WINDOW_HOURS,
        )));
        if let Err(e) = predictor.refresh(store.clone(), &breakers.db).await {
            tracing::warn!("Route predictor starts empty: {}", e);
        }
        refresher = spawn_refresh(
            predictor.clone(),
            store.clone(),
            breakers.db.clone(),
            config.routing.predictor_refresh_secs,
            shutdown_rx,
        );
        gateway = gateway.with_predictor(predictor);
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app(Arc::new(gateway)))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    if let Some(handle) = refresher {
        let _ = handle.await;
    }
    // The app (and its audit sender) is gone, so the writer drains and exits.
    if let Some(handle) = writer {
        let _ = handle.await;
    }
    Ok(())
}
