use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod api;
mod auth;
mod backend;
mod config;
mod db;
mod error;
mod ingestion;
mod ollama;
mod service;

use crate::auth::StaticTokenVerifier;
use crate::backend::OllamaBackend;
use crate::config::{RuntimeConfig, load_static_config};
use crate::db::Database;
use crate::service::DocflowService;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    init_logging();

    info!("Starting docflow service v{}", env!("CARGO_PKG_VERSION"));

    let metrics = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Prometheus recorder not installed, /metrics disabled");
            None
        }
    };

    // Load static configuration (server binding, storage path, tokens)
    // We need to load this first to know where the database is
    let static_config = load_static_config()?;

    info!(
        host = %static_config.server.host,
        port = static_config.server.port,
        "Static configuration loaded"
    );

    // Ensure data directory exists
    std::fs::create_dir_all(&static_config.storage.data_dir)?;

    // Initialize database
    let db_path = static_config.storage.database_path();
    let db = Arc::new(Database::open(&db_path)?);
    info!(path = %db_path.display(), "Database initialized");

    // Load runtime config (static + dynamic with DB overrides)
    let runtime_config = Arc::new(RuntimeConfig::load(static_config, &db)?);
    info!("Runtime configuration loaded with DB settings");

    let verifier = StaticTokenVerifier::new(&runtime_config.static_config.auth.tokens);
    if verifier.is_empty() {
        warn!("No API tokens configured; every /api request will be rejected");
    }
    let backend = OllamaBackend::new(runtime_config.clone())?;

    // Initialize the service
    let service = Arc::new(
        DocflowService::new(
            db,
            runtime_config.clone(),
            Arc::new(backend),
            Arc::new(verifier),
        )
        .await?,
    );

    // Interval triggers; the HTTP trigger endpoints run the same operations
    let shutdown = CancellationToken::new();
    let triggers = [
        DocflowService::start_dispatch_trigger(service.clone(), shutdown.clone()),
        DocflowService::start_reaper_trigger(service.clone(), shutdown.clone()),
    ];

    // Build the router
    let app = api::router(service, metrics);

    // Start the server
    let addr = format!(
        "{}:{}",
        runtime_config.static_config.server.host, runtime_config.static_config.server.port
    );
    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down triggers");
    shutdown.cancel();
    for trigger in triggers {
        if let Err(e) = trigger.await {
            warn!(error = %e, "Trigger task ended abnormally");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let format = fmt::format()
        .with_target(true)
        .with_thread_ids(true)
        .compact();

    // Use RUST_LOG if set, otherwise default to info level for our crate
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("docflow_service=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().event_format(format))
        .with(filter)
        .init();
}
