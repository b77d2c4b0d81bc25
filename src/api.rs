use axum::{
    Json, Router,
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::hub::{ConnectionTiming, Hub, Interest, WireMessage};
use crate::store::ContainerUpdate;
use crate::tracking::{AddRequest, Tracker, TrackingError};
use crate::types::RetentionPolicy;

/// State shared across axum handlers.
pub struct AppState {
    pub tracker: Tracker,
    pub hub: Hub,
    pub timing: ConnectionTiming,
    pub backfill_limit: i64,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/containers", get(list_containers).post(add_container))
        .route(
            "/api/containers/{id}",
            axum::routing::put(update_container).delete(remove_container),
        )
        .route("/api/containers/{id}/logs", get(get_logs))
        .route("/api/ws/containers", get(containers_ws))
        .route("/api/ws/{id}", get(container_ws))
        .route("/api/docker/containers", get(docker_containers))
        .with_state(state)
}

/// Serves the API until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Listening on {addr}");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}

impl IntoResponse for TrackingError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            TrackingError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            TrackingError::Invalid(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            TrackingError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "store_error"),
            TrackingError::Runtime(_) => (StatusCode::BAD_GATEWAY, "runtime_error"),
        };
        if status.is_server_error() {
            log::error!("Request failed: {self}");
        }
        (status, Json(json!({ "error": self.to_string(), "code": code }))).into_response()
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let reachable = state.tracker.runtime_reachable().await;
    Json(json!({
        "status": if reachable { "ok" } else { "degraded" },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "docker": if reachable { "connected" } else { "unreachable" },
        "viewers": state.hub.connection_count().await,
    }))
}

async fn list_containers(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, TrackingError> {
    let containers = state.tracker.list().await?;
    Ok(Json(json!({ "containers": containers })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddContainerBody {
    name: String,
    alias: Option<String>,
    server_name: Option<String>,
    max_period: Option<i64>,
    max_lines: Option<i64>,
}

async fn add_container(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AddContainerBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), TrackingError> {
    let added = state
        .tracker
        .add(AddRequest {
            name: body.name,
            alias: body.alias,
            server_name: body.server_name,
            policy: RetentionPolicy::new(
                body.max_period.unwrap_or(0),
                body.max_lines.unwrap_or(0),
            ),
        })
        .await?;

    if added.already_tracked {
        Ok((
            StatusCode::OK,
            Json(json!({
                "container": added.container,
                "success": true,
                "message": "Container already tracked",
            })),
        ))
    } else {
        Ok((
            StatusCode::CREATED,
            Json(json!({ "container": added.container, "success": true })),
        ))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateContainerBody {
    #[serde(default)]
    container_name: String,
    #[serde(default)]
    alias: String,
    #[serde(default)]
    server_name: String,
    #[serde(default)]
    max_period: i64,
    #[serde(default)]
    max_lines: i64,
}

async fn update_container(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<UpdateContainerBody>,
) -> Result<Json<serde_json::Value>, TrackingError> {
    let container = state
        .tracker
        .update(
            &id,
            ContainerUpdate {
                name: body.container_name,
                alias: body.alias,
                server_name: body.server_name,
                policy: RetentionPolicy::new(body.max_period, body.max_lines),
            },
        )
        .await?;
    Ok(Json(json!({ "container": container, "success": true })))
}

async fn remove_container(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, TrackingError> {
    state.tracker.remove(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    limit: Option<i64>,
    before: Option<String>,
}

async fn get_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<crate::tracking::LogPage>, TrackingError> {
    let before = query.before.as_deref().map(parse_before).transpose()?;
    let page = state.tracker.get_logs(&id, query.limit, before).await?;
    Ok(Json(page))
}

/// Accepts integer nanoseconds or an RFC3339 instant.
fn parse_before(value: &str) -> Result<i64, TrackingError> {
    if let Ok(nanos) = value.parse::<i64>() {
        return Ok(nanos);
    }
    chrono::DateTime::parse_from_rfc3339(value)
        .ok()
        .and_then(|ts| ts.timestamp_nanos_opt())
        .ok_or_else(|| TrackingError::Invalid(format!("Invalid 'before' value: {value}")))
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    limit: Option<i64>,
}

async fn container_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<WsQuery>,
) -> Result<Response, TrackingError> {
    state.tracker.get(&id).await?;
    let limit = query.limit.unwrap_or(state.backfill_limit);

    Ok(ws.on_upgrade(move |socket| async move {
        let interest = Interest::Container(id.clone());
        let load = || backfill_message(&state.tracker, &id, limit);
        crate::hub::serve(socket, state.hub.clone(), interest, load, state.timing).await
    }))
}

async fn backfill_message(tracker: &Tracker, id: &str, limit: i64) -> WireMessage {
    match tracker.backfill(id, limit).await {
        Ok(logs) => {
            debug!("Viewer attaching to {id} with {} backfilled line(s)", logs.len());
            WireMessage::LogsBatch(logs)
        }
        Err(e) => {
            warn!("Backfill for viewer of {id} failed: {e}");
            WireMessage::Error(e.to_string())
        }
    }
}

async fn containers_ws(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| async move {
        let load = || containers_message(&state.tracker);
        crate::hub::serve(socket, state.hub.clone(), Interest::Aggregate, load, state.timing)
            .await
    })
}

async fn containers_message(tracker: &Tracker) -> WireMessage {
    match tracker.list().await {
        Ok(containers) => WireMessage::Containers(containers),
        Err(e) => {
            warn!("Listing containers for a new viewer failed: {e}");
            WireMessage::Error(e.to_string())
        }
    }
}

async fn docker_containers(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<crate::runtime::Workload>>, TrackingError> {
    Ok(Json(state.tracker.inventory().await?))
}
