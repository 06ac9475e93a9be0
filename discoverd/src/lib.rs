pub mod agent;
pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod store;
pub mod store_manager;

use std::time::Duration;
use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use crate::agent::Agent;

/// Serve the agent's HTTP API on `listener` until `cancel` fires.
///
/// Open subscribe streams are ended on cancellation so that graceful
/// shutdown does not wait on them forever.
pub async fn serve(
    listener: TcpListener,
    agent: Agent,
    keep_alive: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let app = api::routes::router(api::routes::AppState {
        agent,
        keep_alive,
        shutdown: cancel.clone(),
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("HTTP server failed")
}
