// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HTTP request handlers for the REST API and the instance WebSocket.

use crate::allocator::model::{CameraRequest, Instance, InstanceInfo, MetricsSnapshot};
use crate::engine::StartOutcome;
use crate::launcher::{generate_instance_id, LaunchRecord, LaunchStatus, ProcessLauncher};
use crate::protocol::{AnalysisKind, AnalysisStatus, CameraId, FileDescriptor, StreamId};
use crate::registry::{ConnectionInfo, ConnectionRecord, SendError};
use crate::reconnect::ReconnectStats;
use crate::server::AppState;
use crate::session::InstanceSession;
use crate::shutdown::{DrainReport, ShutdownError, ShutdownPhase};
use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// API error response
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    pub code: u16,
}

impl ApiError {
    pub fn new(code: StatusCode, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.as_u16(),
        }
    }

    pub fn not_found(error: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

impl From<SendError> for ApiError {
    fn from(err: SendError) -> Self {
        let code = match err {
            SendError::NotConnected(_) | SendError::ChannelClosed(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            SendError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(code, err.to_string())
    }
}

impl From<ShutdownError> for ApiError {
    fn from(err: ShutdownError) -> Self {
        match err {
            ShutdownError::AlreadyDraining => Self::new(StatusCode::CONFLICT, err.to_string()),
        }
    }
}

/// Answer to requests that only queue a message for an instance.
#[derive(Debug, Serialize)]
pub struct Accepted {
    pub instance_id: String,
    pub request_id: String,
}

fn accepted(instance_id: &str, request_id: String) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(Accepted {
            instance_id: instance_id.to_string(),
            request_id,
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

/// GET /ws - instance endpoint
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let session = InstanceSession::new(
        state.engine.clone(),
        state.registry.clone(),
        state.config.outbound_buffer,
    );
    ws.on_upgrade(move |socket| session.run(socket))
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: i64,
    pub instances: usize,
    pub connected_instances: usize,
    pub connections: usize,
}

/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Health> {
    let status = match state.shutdown.phase() {
        ShutdownPhase::Draining => "draining",
        ShutdownPhase::Running | ShutdownPhase::Drained => "healthy",
    };
    Json(Health {
        status,
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: (chrono::Utc::now() - state.started_at).num_seconds(),
        instances: state.allocator.instance_count(),
        connected_instances: state.registry.connected_instances().len(),
        connections: state.registry.len(),
    })
}

#[derive(Debug, Serialize)]
pub struct Stats {
    pub shutdown_phase: ShutdownPhase,
    pub connections: Vec<ConnectionInfo>,
    pub history: Vec<ConnectionRecord>,
    pub pending_requests: usize,
    pub reconnects: BTreeMap<String, ReconnectStats>,
}

/// GET /stats
pub async fn stats(State(state): State<Arc<AppState>>) -> Json<Stats> {
    Json(Stats {
        shutdown_phase: state.shutdown.phase(),
        connections: state.registry.snapshot(),
        history: state.registry.history(),
        pending_requests: state.tracker.len(),
        reconnects: state.reconnect.all_stats().into_iter().collect(),
    })
}

/// POST /admin/shutdown - drain every connection
pub async fn admin_shutdown(
    State(state): State<Arc<AppState>>,
) -> Result<Json<DrainReport>, ApiError> {
    info!("Drain requested over HTTP");
    Ok(Json(state.shutdown.drain().await?))
}

// ---------------------------------------------------------------------------
// Instances and processes
// ---------------------------------------------------------------------------

/// GET /instances
pub async fn list_instances(State(state): State<Arc<AppState>>) -> Json<Vec<InstanceInfo>> {
    Json(state.allocator.instances())
}

/// GET /instances/:id
pub async fn get_instance(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> Result<Json<Instance>, ApiError> {
    state
        .allocator
        .instance(&instance_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("Instance '{}' not found", instance_id)))
}

/// POST /instances/:id/terminate
pub async fn terminate_instance(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> Result<Response, ApiError> {
    let request_id = state.engine.terminate_app(&instance_id).await?;
    Ok(accepted(&instance_id, request_id))
}

/// GET /processes
pub async fn list_processes(State(state): State<Arc<AppState>>) -> Json<Vec<LaunchRecord>> {
    Json(state.launcher.records())
}

fn default_instance_prefix() -> String {
    "instance".to_string()
}

#[derive(Debug, Deserialize)]
pub struct LaunchBody {
    /// Generated from `prefix` when absent
    pub instance_id: Option<String>,
    #[serde(default = "default_instance_prefix")]
    pub prefix: String,
    pub config_path: String,
    pub streams_count: u32,
    pub host_pid: Option<u32>,
}

/// POST /processes - record a launched process and register its instance
pub async fn launch_process(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LaunchBody>,
) -> Result<Response, ApiError> {
    if body.streams_count == 0 {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "streams_count must be at least 1",
        ));
    }
    let instance_id = match body.instance_id {
        Some(id) if id.is_empty() => {
            return Err(ApiError::new(StatusCode::BAD_REQUEST, "Empty instance_id"));
        }
        Some(id) => id,
        None => generate_instance_id(&body.prefix),
    };
    if let Some(existing) = state.launcher.lookup(&instance_id) {
        if existing.status != LaunchStatus::Stopped {
            return Err(ApiError::new(
                StatusCode::CONFLICT,
                format!("Instance '{}' is already launched", instance_id),
            ));
        }
    }

    let mut record = LaunchRecord::new(instance_id.as_str(), body.config_path.as_str())
        .with_streams_count(body.streams_count);
    if let Some(pid) = body.host_pid {
        record = record.with_host_pid(pid);
    }
    state.launcher.record_launch(record.clone());
    state.allocator.register_instance(
        &instance_id,
        &body.config_path,
        body.streams_count as usize,
    );
    info!("Launch of '{}' recorded over HTTP", instance_id);

    Ok((StatusCode::CREATED, Json(record)).into_response())
}

/// GET /processes/:instance_id
pub async fn get_process(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> Result<Json<LaunchRecord>, ApiError> {
    state
        .launcher
        .lookup(&instance_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("No process for '{}'", instance_id)))
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct StartAnalysisBody {
    pub camera_id: CameraId,
    pub camera_type: AnalysisKind,
    pub path: String,
    pub name: String,
    pub output_dir: String,
    #[serde(default)]
    pub files: Vec<FileDescriptor>,
}

#[derive(Debug, Serialize)]
pub struct StartAnalysisReply {
    pub instance_id: String,
    pub stream_id: StreamId,
    pub camera_id: CameraId,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// POST /analysis/start - run a camera on the first free slot
pub async fn start_analysis(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StartAnalysisBody>,
) -> Result<Response, ApiError> {
    let Some((instance_id, stream_id)) = state.allocator.find_available_slot() else {
        warn!("No free stream slot for camera_{}", body.camera_id);
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "No connected instance with a free stream",
        ));
    };

    let camera = CameraRequest {
        camera_id: body.camera_id,
        camera_type: body.camera_type,
        path: body.path,
        name: body.name,
        output_dir: body.output_dir,
    };
    let outcome = state
        .engine
        .submit_camera(&instance_id, stream_id, camera, &body.files)
        .await?;

    let (status, code, request_id) = match outcome {
        StartOutcome::Started { request_id } => ("started", StatusCode::CREATED, Some(request_id)),
        StartOutcome::Queued => ("queued", StatusCode::ACCEPTED, None),
        StartOutcome::Rejected => {
            return Err(ApiError::new(
                StatusCode::CONFLICT,
                format!("Camera {} is already active", body.camera_id),
            ));
        }
    };

    let reply = StartAnalysisReply {
        instance_id,
        stream_id,
        camera_id: body.camera_id,
        status,
        request_id,
    };
    Ok((code, Json(reply)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct InterruptQuery {
    pub stream_id: StreamId,
    pub camera_id: CameraId,
    pub reason: Option<String>,
}

/// POST /analysis/:instance_id/interrupt
pub async fn interrupt_analysis(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Query(query): Query<InterruptQuery>,
) -> Result<Response, ApiError> {
    if state.allocator.camera(&instance_id, query.camera_id).is_none() {
        return Err(ApiError::not_found(format!(
            "Camera {} not found on '{}'",
            query.camera_id, instance_id
        )));
    }
    let request_id = state
        .engine
        .interrupt_analysis(&instance_id, query.stream_id, query.camera_id, query.reason)
        .await?;
    Ok(accepted(&instance_id, request_id))
}

#[derive(Debug, Serialize)]
pub struct InstanceAnalysis {
    pub instance_id: String,
    #[serde(flatten)]
    pub status: AnalysisStatus,
}

/// GET /analysis/status - every stream of every instance
pub async fn all_analysis_status(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<InstanceAnalysis>> {
    let statuses = state
        .allocator
        .instance_ids()
        .into_iter()
        .filter_map(|instance_id| {
            let status = state.allocator.analysis_status(&instance_id, None, None)?;
            Some(InstanceAnalysis {
                instance_id,
                status,
            })
        })
        .collect();
    Json(statuses)
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub stream_id: Option<StreamId>,
    pub camera_id: Option<CameraId>,
}

/// GET /analysis/status/:instance_id
pub async fn analysis_status(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<InstanceAnalysis>, ApiError> {
    let status = state
        .allocator
        .analysis_status(&instance_id, query.stream_id, query.camera_id)
        .ok_or_else(|| ApiError::not_found("No matching instance, stream or camera"))?;
    Ok(Json(InstanceAnalysis {
        instance_id,
        status,
    }))
}

/// POST /analysis/status/:instance_id/refresh - ask the instance for its own view
pub async fn refresh_analysis_status(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Query(query): Query<StatusQuery>,
) -> Result<Response, ApiError> {
    let request_id = state
        .engine
        .query_analysis_status(&instance_id, query.stream_id, query.camera_id)
        .await?;
    Ok(accepted(&instance_id, request_id))
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct InstanceMetrics {
    pub instance_id: String,
    pub metrics: Option<MetricsSnapshot>,
}

/// GET /metrics - last snapshot of every instance
pub async fn all_metrics(State(state): State<Arc<AppState>>) -> Json<Vec<InstanceMetrics>> {
    let metrics = state
        .allocator
        .instance_ids()
        .into_iter()
        .map(|instance_id| InstanceMetrics {
            metrics: state.allocator.metrics(&instance_id),
            instance_id,
        })
        .collect();
    Json(metrics)
}

/// GET /metrics/:instance_id
pub async fn instance_metrics(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> Result<Json<InstanceMetrics>, ApiError> {
    if !state.allocator.contains(&instance_id) {
        return Err(ApiError::not_found(format!(
            "Instance '{}' not found",
            instance_id
        )));
    }
    Ok(Json(InstanceMetrics {
        metrics: state.allocator.metrics(&instance_id),
        instance_id,
    }))
}

/// POST /metrics/:instance_id/refresh - ask the instance for fresh numbers
pub async fn refresh_metrics(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> Result<Response, ApiError> {
    let request_id = state.engine.query_metrics(&instance_id).await?;
    Ok(accepted(&instance_id, request_id))
}
