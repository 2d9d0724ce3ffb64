//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::deploy::events::DeploymentEvent;
use crate::errors::DeployerError;
use crate::models::deployment::DeploymentConfig;
use crate::server::state::ServerState;
use crate::utils::version_info;

/// Error body returned by every failing handler
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for DeployerError {
    fn into_response(self) -> Response {
        let status = match &self {
            DeployerError::NotFound(_) => StatusCode::NOT_FOUND,
            DeployerError::ValidationError(_) | DeployerError::ConfigError(_) => {
                StatusCode::BAD_REQUEST
            }
            DeployerError::InvalidTransition(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorResponse {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "webduh-deployer".to_string(),
        version: version.version,
    })
}

/// Version response
#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

/// List every known deployment, newest first
pub async fn list_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(state.runner.list())
}

/// Submit response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub deployment_id: String,
    pub status: String,
}

/// Submit a new deployment
pub async fn submit_handler(
    State(state): State<Arc<ServerState>>,
    Json(config): Json<DeploymentConfig>,
) -> Result<impl IntoResponse, DeployerError> {
    if config.project_id.trim().is_empty() {
        return Err(DeployerError::ValidationError("projectId is required".to_string()));
    }
    if config.user_id.trim().is_empty() {
        return Err(DeployerError::ValidationError("userId is required".to_string()));
    }

    let deployment_id = state.runner.submit(config);
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            deployment_id,
            status: "queued".to_string(),
        }),
    ))
}

/// Status of a single deployment
pub async fn status_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, DeployerError> {
    state
        .runner
        .get_status(&id)
        .map(Json)
        .ok_or(DeployerError::NotFound(format!("deployment {}", id)))
}

/// Cancel response
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

/// Cancel a deployment; finished deployments answer 409
pub async fn cancel_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, DeployerError> {
    if state.runner.get_status(&id).is_none() {
        return Err(DeployerError::NotFound(format!("deployment {}", id)));
    }

    let cancelled = state.runner.cancel(&id);
    let status = if cancelled {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    Ok((status, Json(CancelResponse { cancelled })))
}

/// Cleanup request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupRequest {
    #[serde(default = "default_older_than_days")]
    pub older_than_days: u32,
}

fn default_older_than_days() -> u32 {
    7
}

/// Cleanup response
#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub removed: usize,
}

/// Remove finished deployments older than the requested age
pub async fn cleanup_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<CleanupRequest>,
) -> impl IntoResponse {
    let removed = state.runner.cleanup(request.older_than_days).await;
    Json(CleanupResponse { removed })
}

/// Optional filter for the event stream
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    pub deployment_id: Option<String>,
}

/// Upgrade to a WebSocket that relays lifecycle events as JSON text frames
pub async fn events_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<EventsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let rx = state.runner.subscribe();
    ws.on_upgrade(move |socket| relay_events(socket, rx, query.deployment_id))
}

async fn relay_events(
    socket: WebSocket,
    mut rx: broadcast::Receiver<DeploymentEvent>,
    filter: Option<String>,
) {
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => {
                    if filter.as_deref().is_some_and(|id| id != event.deployment_id()) {
                        continue;
                    }
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Failed to serialize {}: {}", event.name(), e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagging, events dropped");
                }
                Err(RecvError::Closed) => break,
            },
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    debug!("Event subscriber disconnected");
}
