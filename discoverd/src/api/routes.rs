use std::time::Duration;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use shared::protocol::{
    subscribe_path, ERR_INTERNAL, ERR_INVALID_ARGUMENT, ERR_NOT_FOUND, PATH_HEALTH, PATH_HEARTBEAT,
    PATH_REGISTER, PATH_UNREGISTER,
};
use shared::types::{ErrorResponse, InstanceRequest, RegisterRequest};
use crate::agent::Agent;
use crate::error::DiscoveryError;

#[derive(Clone)]
pub struct AppState {
    pub agent: Agent,
    pub keep_alive: Duration,
    /// Ends open subscribe streams so graceful shutdown can complete
    pub shutdown: CancellationToken,
}

/// A `DiscoveryError` rendered as an HTTP response
pub struct ApiError(DiscoveryError);

impl From<DiscoveryError> for ApiError {
    fn from(e: DiscoveryError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            DiscoveryError::NotFound { .. } => (StatusCode::NOT_FOUND, ERR_NOT_FOUND),
            DiscoveryError::InvalidArgument(_) => (StatusCode::BAD_REQUEST, ERR_INVALID_ARGUMENT),
            DiscoveryError::Serialization(_) | DiscoveryError::Store(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, ERR_INTERNAL)
            }
        };
        let body = ErrorResponse {
            code: code.to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(PATH_HEALTH, get(health))
        .route(PATH_REGISTER, post(register))
        .route(PATH_UNREGISTER, post(unregister))
        .route(PATH_HEARTBEAT, post(heartbeat))
        .route(&subscribe_path(":name"), get(subscribe))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<StatusCode, ApiError> {
    state.agent.register(&req.name, &req.addr, &req.attrs).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unregister(
    State(state): State<AppState>,
    Json(req): Json<InstanceRequest>,
) -> Result<StatusCode, ApiError> {
    state.agent.unregister(&req.name, &req.addr).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn heartbeat(
    State(state): State<AppState>,
    Json(req): Json<InstanceRequest>,
) -> Result<StatusCode, ApiError> {
    state.agent.heartbeat(&req.name, &req.addr).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Push stream of `ServiceUpdate`s, one JSON document per SSE event.
///
/// A failed backend subscribe is answered with an error status before any
/// stream is opened, so the caller never waits on a dead subscription.
async fn subscribe(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let updates = state.agent.subscribe(&name).await?;

    let shutdown = state.shutdown.clone();
    let events = ReceiverStream::new(updates)
        .map(|update| Event::default().json_data(update))
        .take_until(async move { shutdown.cancelled().await });

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(state.keep_alive)))
}
