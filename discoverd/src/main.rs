use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use discoverd::agent::Agent;
use discoverd::backend::StoreBackend;
use discoverd::config::Config;
use discoverd::store::db::KvDb;
use discoverd::store_manager::{self, StoreHandle};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("discoverd=info"))
        )
        .init();

    tracing::info!("Starting discoverd");

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/discover/discoverd.toml".to_string());

    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    // Open the registration store
    let db = KvDb::open(&config.store.db_path)?;
    tracing::info!("Opened database at {:?}", config.store.db_path);

    let store = StoreHandle::spawn(db, config.store.watch_capacity);

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Spawn expiry loop
    let expiry_cancel = cancel.clone();
    let expiry_store = store.clone();
    let expiry_interval = config.store.expiry_interval();
    let expiry_handle = tokio::spawn(async move {
        if let Err(e) = store_manager::run(expiry_store, expiry_interval, expiry_cancel).await {
            tracing::error!("Expiry loop error: {}", e);
        }
    });

    let backend = StoreBackend::new(store.clone(), config.store.key_prefix.clone())
        .with_ttl(config.store.ttl());
    let agent = Agent::new(Arc::new(backend));

    // Bind HTTP server
    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    // Run server with graceful shutdown
    let server_cancel = cancel.clone();
    let keep_alive = config.api.keep_alive();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = discoverd::serve(listener, agent, keep_alive, server_cancel).await {
            tracing::error!("Server error: {:#}", e);
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    // Trigger cancellation
    cancel.cancel();

    // Wait for all tasks to complete
    let _ = tokio::join!(expiry_handle, server_handle);

    // Shutdown store thread
    if let Err(e) = store.shutdown().await {
        tracing::error!("Failed to shutdown store: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
