// Kube Tunnel Manager - REST API Module
// HTTP endpoints for tunnel control, discovery, and the SSE event stream

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::Event,
    response::{IntoResponse, Sse},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use serde::Serialize;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{error, info};
use uuid::Uuid;

use kube_tunnel_common::{Error, TunnelConfig, TunnelStatusResponse};

use crate::discovery::DiscoveryClient;
use crate::supervisor::{ConnectionSupervisor, TunnelEvent};

/// Shared application state
pub struct AppState {
    pub supervisor: ConnectionSupervisor,
    pub store: kube_tunnel_common::TunnelStore,
    pub discovery: DiscoveryClient,
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

/// API error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// API success response
#[derive(Serialize)]
struct SuccessResponse {
    message: String,
}

/// One tunnel with its persisted config and live status
#[derive(Serialize)]
struct TunnelDetail {
    config: TunnelConfig,
    status: TunnelStatusResponse,
}

#[derive(Serialize)]
struct TunnelsListResponse {
    tunnels: Vec<TunnelDetail>,
}

/// Event shape on the SSE wire
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutgoingEvent {
    Starting { id: Uuid },
    Connected { id: Uuid },
    Disconnected { id: Uuid, reason: String },
    Error { id: Uuid, error: String },
    AllReady,
    Heartbeat { timestamp: DateTime<Utc> },
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/tunnels", get(list_tunnels).post(add_tunnel))
        .route("/api/tunnels/:id", put(update_tunnel).delete(remove_tunnel))
        .route("/api/tunnels/:id/start", post(start_tunnel))
        .route("/api/tunnels/:id/stop", post(stop_tunnel))
        .route("/api/tunnels/:id/restart", post(restart_tunnel))
        .route("/api/tunnels/:id/status", get(tunnel_status))
        .route("/api/namespaces", get(list_namespaces))
        .route("/api/namespaces/:namespace/services", get(list_services))
        .route("/api/events", get(event_stream))
        .with_state(state)
}

/// Map typed failures onto client-facing status codes
fn error_status(error: &Error) -> StatusCode {
    match error {
        Error::TunnelNotFound(_) | Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::TunnelExists(_) => StatusCode::CONFLICT,
        Error::Config(_) => StatusCode::BAD_REQUEST,
        Error::Runtime(_) => StatusCode::CONFLICT,
        Error::ClusterUnreachable(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: &Error) -> axum::response::Response {
    (
        error_status(error),
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

/// Health check endpoint
async fn health() -> &'static str {
    "OK"
}

/// List all tunnels with their live status
async fn list_tunnels(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut tunnels = Vec::new();
    for status in state.supervisor.list().await {
        if let Some(config) = state.supervisor.get_config(&status.id).await {
            tunnels.push(TunnelDetail { config, status });
        }
    }

    Json(TunnelsListResponse { tunnels })
}

/// Add a tunnel and persist it
async fn add_tunnel(
    State(state): State<Arc<AppState>>,
    Json(config): Json<TunnelConfig>,
) -> impl IntoResponse {
    info!("API: Add tunnel request for '{}'", config.name);

    if let Err(e) = config.validate() {
        return error_response(&e);
    }

    if let Err(e) = state.store.add(config.clone()) {
        error!("Failed to persist tunnel '{}': {}", config.name, e);
        let message = e.to_string();
        let status = if message.contains("already exists") {
            StatusCode::CONFLICT
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        return (status, Json(ErrorResponse { error: message })).into_response();
    }

    state.supervisor.insert(config.clone()).await;

    (
        StatusCode::CREATED,
        Json(SuccessResponse {
            message: format!("Tunnel '{}' created", config.name),
        }),
    )
        .into_response()
}

/// Apply an edited tunnel configuration
async fn update_tunnel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(config): Json<TunnelConfig>,
) -> impl IntoResponse {
    info!("API: Update tunnel request for {}", id);

    if config.id != id {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "Tunnel ID in request body doesn't match URL".to_string(),
            }),
        )
            .into_response();
    }
    if let Err(e) = config.validate() {
        return error_response(&e);
    }

    if let Err(e) = state.supervisor.update(config.clone()).await {
        return error_response(&e);
    }

    if let Err(e) = state.store.update(config.clone()) {
        error!("Failed to persist tunnel '{}': {}", config.name, e);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
            .into_response();
    }

    Json(SuccessResponse {
        message: format!("Tunnel '{}' updated", config.name),
    })
    .into_response()
}

/// Stop and remove a tunnel
async fn remove_tunnel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    info!("API: Remove tunnel request for {}", id);

    if let Err(e) = state.supervisor.remove(&id).await {
        return error_response(&e);
    }

    match state.store.remove(&id) {
        Ok(removed) => Json(SuccessResponse {
            message: format!("Tunnel '{}' removed", removed.name),
        })
        .into_response(),
        Err(e) => {
            error!("Failed to remove tunnel {} from store: {}", id, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response()
        }
    }
}

/// Start a tunnel
async fn start_tunnel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    info!("API: Start tunnel request for {}", id);

    match state.supervisor.start(id).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(SuccessResponse {
                message: format!("Tunnel {} starting", id),
            }),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to start tunnel {}: {}", id, e);
            error_response(&e)
        }
    }
}

/// Stop a tunnel
async fn stop_tunnel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    info!("API: Stop tunnel request for {}", id);

    match state.supervisor.stop(&id).await {
        Ok(()) => Json(SuccessResponse {
            message: format!("Tunnel {} stopped", id),
        })
        .into_response(),
        Err(e) => {
            error!("Failed to stop tunnel {}: {}", id, e);
            error_response(&e)
        }
    }
}

/// Restart a tunnel
async fn restart_tunnel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    info!("API: Restart tunnel request for {}", id);

    match state.supervisor.restart(id).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(SuccessResponse {
                message: format!("Tunnel {} restarting", id),
            }),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to restart tunnel {}: {}", id, e);
            error_response(&e)
        }
    }
}

/// Get one tunnel's live status
async fn tunnel_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.supervisor.get_status(&id).await {
        Some(status) => Json(status).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("Tunnel {} not found", id),
            }),
        )
            .into_response(),
    }
}

/// List cluster namespaces
async fn list_namespaces(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.discovery.list_namespaces().await {
        Ok(namespaces) => Json(namespaces).into_response(),
        Err(e) => {
            error!("Namespace discovery failed: {}", e);
            error_response(&e)
        }
    }
}

/// List services in a namespace
async fn list_services(
    State(state): State<Arc<AppState>>,
    Path(namespace): Path<String>,
) -> impl IntoResponse {
    match state.discovery.list_services(&namespace).await {
        Ok(services) => Json(services).into_response(),
        Err(e) => {
            error!("Service discovery failed for '{}': {}", namespace, e);
            error_response(&e)
        }
    }
}

/// GET /api/events → SSE stream of tunnel events
pub async fn event_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.supervisor.subscribe();
    let mut shutdown_rx = state.shutdown_tx.subscribe();

    let tunnel_events = BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(ev) => {
                let outgoing = match ev {
                    TunnelEvent::Starting { id } => OutgoingEvent::Starting { id },
                    TunnelEvent::Connected { id } => OutgoingEvent::Connected { id },
                    TunnelEvent::Disconnected { id, reason } => {
                        OutgoingEvent::Disconnected { id, reason }
                    }
                    TunnelEvent::Error { id, error } => OutgoingEvent::Error { id, error },
                    TunnelEvent::AllReady => OutgoingEvent::AllReady,
                };

                match serde_json::to_string(&outgoing) {
                    Ok(json) => Some(Ok(Event::default().data(json))),
                    Err(e) => {
                        tracing::error!("Failed to serialize OutgoingEvent: {e}");
                        None
                    }
                }
            }
            Err(lagged) => {
                // Slow client fell behind the broadcast buffer; it will pick
                // up from the next event
                tracing::debug!("Event stream lagged: {:?}, continuing", lagged);
                None
            }
        }
    });

    // Heartbeats keep connections warm and let clients detect daemon death
    let heartbeats = heartbeat_stream();
    let merged = stream::select(tunnel_events, heartbeats);

    let shutdown_aware = merged.take_until(async move {
        let _ = shutdown_rx.recv().await;
    });

    Sse::new(shutdown_aware)
}

fn heartbeat_stream(
) -> impl futures::Stream<Item = Result<Event, Infallible>> + Send + Sync + 'static {
    tokio_stream::wrappers::IntervalStream::new(tokio::time::interval(heartbeat_interval()))
        .map(|_| Ok(Event::default().data(heartbeat_payload())))
}

fn heartbeat_payload() -> String {
    match serde_json::to_string(&OutgoingEvent::Heartbeat {
        timestamp: Utc::now(),
    }) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!("Failed to serialize heartbeat: {e}");
            "{}".to_string()
        }
    }
}

#[cfg(not(test))]
fn heartbeat_interval() -> Duration {
    Duration::from_secs(10)
}

#[cfg(test)]
fn heartbeat_interval() -> Duration {
    Duration::from_millis(100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn heartbeat_stream_emits() {
        let mut stream = heartbeat_stream();
        let _evt = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("heartbeat timed out")
            .expect("stream ended");

        let json = heartbeat_payload();
        assert!(json.contains("heartbeat"), "heartbeat payload missing marker");
    }

    #[test]
    fn error_statuses_match_taxonomy() {
        assert_eq!(
            error_status(&Error::TunnelNotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_status(&Error::ClusterUnreachable("x".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            error_status(&Error::Config("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_status(&Error::Runtime("x".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            error_status(&Error::ExecutionFailed("x".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
