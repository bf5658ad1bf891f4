//! HTTP API — runs alongside the recording process.
//!
//! Endpoints:
//!   GET  /api/status                               → all channel statuses
//!   GET  /api/status/{channel}                     → one channel status
//!   POST /api/channels/start                       → start/add/replace a channel (JSON config)
//!   POST /api/channels/{channel}/stop              → stop a channel
//!   POST /api/channels/restart-all                 → stop all, recorders self-restart
//!   GET  /api/clip?channel=&from=&to=&evidence=    → assemble a clip (JSON metadata)
//!   GET  /api/stream?channel=&from=&to=            → fragmented mp4 byte-stream
//!   GET  /api/segments?channel=&from=&to=          → overlapping segments (incl. in-progress)
//!   GET  /api/dates?channel=                       → recording dates
//!   GET  /api/disk                                 → filesystem usage percent
//!   GET  /api/processes                            → registered worker processes
//!   GET  /api/processes/{pid}/log                  → rolling log tail
//!
//! Times are epoch milliseconds. The auth layer upstream supplies an opaque
//! session id per stream call in `x-session-id`; it is never validated here.

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use crate::config::ChannelConfig;
use crate::error::NvrError;
use crate::procs::ProcessRegistry;
use crate::retrieval::{ClipRequest, RetrievalEngine};
use crate::schedule::{SchedulerHandle, StartChannelOutcome};
use crate::storage::eviction;
use crate::storage::index::SharedIndex;

/// Shared state passed to all handlers.
pub struct AppState {
    pub scheduler: SchedulerHandle,
    pub engine: RetrievalEngine,
    pub index: SharedIndex,
    pub registry: Arc<ProcessRegistry>,
    pub base_path: PathBuf,
}

// ──────────────── request / response types ────────────────────────────────

#[derive(Deserialize)]
pub struct RangeParams {
    channel: String,
    from: i64,
    to: i64,
}

#[derive(Deserialize)]
pub struct ClipParams {
    channel: String,
    from: i64,
    to: i64,
    #[serde(default)]
    evidence: bool,
    #[serde(default)]
    order_id: Option<String>,
}

#[derive(Deserialize)]
pub struct ChannelParams {
    channel: String,
}

#[derive(Serialize)]
struct SegmentSpan {
    start: i64,
    end: i64,
    in_progress: bool,
}

// ──────────────── router ──────────────────────────────────────────────────

/// Build the axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(handle_status_all))
        .route("/api/status/{channel}", get(handle_status_one))
        .route("/api/channels/start", post(handle_start_channel))
        .route("/api/channels/{channel}/stop", post(handle_stop_channel))
        .route("/api/channels/restart-all", post(handle_restart_all))
        .route("/api/clip", get(handle_clip))
        .route("/api/stream", get(handle_stream))
        .route("/api/segments", get(handle_segments))
        .route("/api/dates", get(handle_dates))
        .route("/api/disk", get(handle_disk))
        .route("/api/processes", get(handle_processes))
        .route("/api/processes/{pid}/log", get(handle_process_log))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn start_server(state: Arc<AppState>, port: u16) {
    let app = build_router(state);
    let addr = format!("0.0.0.0:{}", port);
    info!(port, "HTTP API listening on http://{}", addr);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, "Failed to bind HTTP server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "HTTP server error");
    }
}

fn error_response(e: NvrError) -> axum::response::Response {
    let status = match &e {
        NvrError::NotFound => StatusCode::NOT_FOUND,
        NvrError::ChannelNotFound { .. } => StatusCode::NOT_FOUND,
        NvrError::Config(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, axum::Json(serde_json::json!({"error": e.to_string()}))).into_response()
}

// ──────────────── handlers ────────────────────────────────────────────────

async fn handle_status_all(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let statuses = state.scheduler.status_all().await;
    axum::Json(serde_json::to_value(statuses).unwrap_or_default())
}

async fn handle_status_one(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
) -> axum::response::Response {
    match state.scheduler.status(&channel).await {
        Some(status) => axum::Json(serde_json::to_value(status).unwrap_or_default()).into_response(),
        None => error_response(NvrError::ChannelNotFound { id: channel }),
    }
}

async fn handle_start_channel(
    State(state): State<Arc<AppState>>,
    axum::Json(config): axum::Json<ChannelConfig>,
) -> axum::response::Response {
    let outcome = state.scheduler.start_channel(config).await;
    let status = match outcome {
        StartChannelOutcome::OutsideWindow => StatusCode::CONFLICT,
        _ => StatusCode::OK,
    };
    (status, axum::Json(serde_json::json!({"result": outcome}))).into_response()
}

async fn handle_stop_channel(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
) -> axum::response::Response {
    if state.scheduler.stop_channel(&channel).await {
        axum::Json(serde_json::json!({"result": "stopped"})).into_response()
    } else {
        error_response(NvrError::ChannelNotFound { id: channel })
    }
}

async fn handle_restart_all(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.scheduler.restart_all().await;
    axum::Json(serde_json::json!({"result": "restarting"}))
}

async fn handle_clip(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ClipParams>,
) -> axum::response::Response {
    let req = ClipRequest {
        channel: params.channel,
        start_ms: params.from,
        end_ms: params.to,
        store_evidence: params.evidence,
        order_id: params.order_id,
    };
    match state.engine.retrieve_clip(req).await {
        Ok(artifact) => {
            axum::Json(serde_json::to_value(artifact).unwrap_or_default()).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn handle_stream(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RangeParams>,
    headers: HeaderMap,
) -> axum::response::Response {
    // Opaque session identifier issued by the auth collaborator.
    let session_id = headers
        .get("x-session-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("anonymous")
        .to_string();

    match state
        .engine
        .open_live_stream(&params.channel, params.from, params.to, &session_id)
        .await
    {
        Ok(stream) => (
            StatusCode::OK,
            [("content-type", "video/mp4")],
            Body::from_stream(stream),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_segments(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RangeParams>,
) -> axum::response::Response {
    let finalized = match state
        .index
        .query_overlapping(&params.channel, params.from, params.to)
    {
        Ok(rows) => rows,
        Err(e) => return error_response(e),
    };

    let mut spans: Vec<SegmentSpan> = finalized
        .iter()
        .map(|r| SegmentSpan { start: r.start_ms, end: r.end_ms, in_progress: false })
        .collect();

    // The in-progress segment is reported when it overlaps the range.
    if let Some(open) = state.scheduler.open_segment(&params.channel).await {
        let now = Utc::now().timestamp_millis();
        if open.start_ms < params.to && now > params.from {
            spans.push(SegmentSpan { start: open.start_ms, end: now, in_progress: true });
        }
    }

    axum::Json(serde_json::json!({
        "channel": params.channel,
        "segments": spans,
        "total": spans.len(),
    }))
    .into_response()
}

async fn handle_dates(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ChannelParams>,
) -> axum::response::Response {
    let mut dates = match state.index.list_dates(&params.channel) {
        Ok(d) => d,
        Err(e) => return error_response(e),
    };

    // "Today" counts when the channel is currently recording, even before
    // its first rotation finalizes anything.
    if let Some(status) = state.scheduler.status(&params.channel).await {
        if status.is_recording {
            let today = Utc::now().format("%Y-%m-%d").to_string();
            if dates.last() != Some(&today) {
                dates.push(today);
            }
        }
    }

    axum::Json(serde_json::json!({ "channel": params.channel, "dates": dates })).into_response()
}

async fn handle_disk(State(state): State<Arc<AppState>>) -> axum::response::Response {
    match eviction::disk_usage_percent(&state.base_path) {
        Ok(pct) => axum::Json(serde_json::json!({ "used_percent": pct })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_processes(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let procs = state.registry.list_all();
    axum::Json(serde_json::to_value(procs).unwrap_or_default())
}

async fn handle_process_log(
    State(state): State<Arc<AppState>>,
    Path(pid): Path<u32>,
) -> axum::response::Response {
    match state.registry.log_tail(pid) {
        Some(lines) => {
            axum::Json(serde_json::json!({ "pid": pid, "log": lines })).into_response()
        }
        None => (
            StatusCode::NOT_FOUND,
            axum::Json(serde_json::json!({"error": format!("No process {pid}")})),
        )
            .into_response(),
    }
}
