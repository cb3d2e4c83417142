// SPDX-License-Identifier: MIT OR Apache-2.0
//! Local control API for a running [`cozy_sync::Core`].
//!
//! `cozy-daemon` owns a single `Core` and exposes it over a small `axum`
//! router: `start`/`stop` drive the background tasks, `status` and
//! `disk-usage` report state, `full-sync` forces a reconciliation pass, and
//! `events` streams progress events as newline-delimited JSON for a shell to
//! render.
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod api;
pub mod middleware;

use crate::api::{ApiError, DiskUsageResponse, StatusResponse};
use axum::body::Body;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware as axum_middleware, Json, Router};
use cozy_sync::{Core, CoreError};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_stream::wrappers::BroadcastStream;

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError::internal(err.to_string())
    }
}

/// Shared state handed to every route handler.
pub struct AppState {
    core: Arc<Core>,
    running: AtomicBool,
}

impl AppState {
    /// Wrap `core`, initially reporting as not running.
    #[must_use]
    pub fn new(core: Arc<Core>) -> Self {
        Self {
            core,
            running: AtomicBool::new(false),
        }
    }
}

/// Build the control API router over `state`.
#[must_use]
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/start", post(cmd_start))
        .route("/stop", post(cmd_stop))
        .route("/status", get(cmd_status))
        .route("/disk-usage", get(cmd_disk_usage))
        .route("/full-sync", post(cmd_full_sync))
        .route("/events", get(cmd_events))
        .layer(axum_middleware::from_fn(crate::middleware::request_logger))
        .layer(axum_middleware::from_fn(crate::middleware::request_id_middleware))
        .with_state(state)
}

async fn cmd_start(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    if state.running.swap(true, Ordering::SeqCst) {
        return Err(ApiError::conflict("core is already running"));
    }
    if let Err(err) = state.core.start().await {
        state.running.store(false, Ordering::SeqCst);
        return Err(err.into());
    }
    Ok(Json(serde_json::json!({ "status": "started" })))
}

async fn cmd_stop(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    if !state.running.swap(false, Ordering::SeqCst) {
        return Err(ApiError::conflict("core is not running"));
    }
    state.core.stop().await;
    Ok(Json(serde_json::json!({ "status": "stopped" })))
}

async fn cmd_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        running: state.running.load(Ordering::SeqCst),
        sync_root: state.core.sync_root().display().to_string(),
        catalog_size: state.core.catalog_size(),
    })
}

async fn cmd_disk_usage(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DiskUsageResponse>, ApiError> {
    let info = state.core.disk_usage().await?;
    Ok(Json(info.into()))
}

async fn cmd_full_sync(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    state.core.full_synchronize().await?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

async fn cmd_events(State(state): State<Arc<AppState>>) -> Response {
    let stream = BroadcastStream::new(state.core.subscribe()).filter_map(|item| async move {
        let event = item.ok()?;
        let mut line = serde_json::to_vec(&event).ok()?;
        line.push(b'\n');
        Some(Ok::<_, std::io::Error>(line))
    });

    Response::builder()
        .header("content-type", "application/x-ndjson")
        .body(Body::from_stream(stream))
        .unwrap()
}
