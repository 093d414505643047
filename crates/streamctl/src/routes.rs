// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Route definitions for the REST API and the instance WebSocket.

use crate::handlers;
use crate::server::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

/// REST API routes
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/stats", get(handlers::stats))
        // Instances and their processes
        .route("/instances", get(handlers::list_instances))
        .route("/instances/:id", get(handlers::get_instance))
        .route("/instances/:id/terminate", post(handlers::terminate_instance))
        .route(
            "/processes",
            get(handlers::list_processes).post(handlers::launch_process),
        )
        .route("/processes/:instance_id", get(handlers::get_process))
        // Analysis jobs
        .route("/analysis/start", post(handlers::start_analysis))
        .route(
            "/analysis/:instance_id/interrupt",
            post(handlers::interrupt_analysis),
        )
        .route("/analysis/status", get(handlers::all_analysis_status))
        .route(
            "/analysis/status/:instance_id",
            get(handlers::analysis_status),
        )
        .route(
            "/analysis/status/:instance_id/refresh",
            post(handlers::refresh_analysis_status),
        )
        // Metrics relay
        .route("/metrics", get(handlers::all_metrics))
        .route("/metrics/:instance_id", get(handlers::instance_metrics))
        .route(
            "/metrics/:instance_id/refresh",
            post(handlers::refresh_metrics),
        )
        .route("/admin/shutdown", post(handlers::admin_shutdown))
}

/// Instance WebSocket route
pub fn ws_routes() -> Router<Arc<AppState>> {
    Router::new().route("/ws", get(handlers::ws_handler))
}
