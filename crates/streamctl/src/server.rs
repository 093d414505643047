// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Control server: wires the services together and serves HTTP + WebSocket.

use crate::allocator::Allocator;
use crate::config::ControlConfig;
use crate::engine::ProtocolEngine;
use crate::launcher::{InMemoryLauncher, ProcessLauncher};
use crate::reconnect::ReconnectManager;
use crate::registry::ConnectionRegistry;
use crate::routes;
use crate::shutdown::{DrainReport, ShutdownError, ShutdownOrchestrator};
use crate::tracker::RequestTracker;
use axum::Router;
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to bind {0}")]
    Bind(String),

    #[error("Server already running")]
    AlreadyRunning,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared application state
pub struct AppState {
    pub config: ControlConfig,
    pub allocator: Arc<Allocator>,
    pub registry: Arc<ConnectionRegistry>,
    pub tracker: Arc<RequestTracker>,
    pub reconnect: Arc<ReconnectManager>,
    pub launcher: Arc<dyn ProcessLauncher>,
    pub engine: Arc<ProtocolEngine>,
    pub shutdown: Arc<ShutdownOrchestrator>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: ControlConfig, launcher: Arc<dyn ProcessLauncher>) -> Self {
        let allocator = Arc::new(Allocator::new());
        let registry = Arc::new(ConnectionRegistry::new(
            allocator.clone(),
            config.history_capacity,
        ));
        let tracker = Arc::new(RequestTracker::new());
        let reconnect = Arc::new(ReconnectManager::new(allocator.clone()));
        let engine = Arc::new(ProtocolEngine::new(
            allocator.clone(),
            registry.clone(),
            tracker.clone(),
            reconnect.clone(),
            launcher.clone(),
        ));
        let shutdown = Arc::new(ShutdownOrchestrator::new(
            registry.clone(),
            engine.clone(),
            config.shutdown.clone(),
        ));

        Self {
            config,
            allocator,
            registry,
            tracker,
            reconnect,
            launcher,
            engine,
            shutdown,
            started_at: Utc::now(),
        }
    }
}

/// Control server for analytics instances.
#[derive(Clone)]
pub struct ControlServer {
    state: Arc<AppState>,
    stop: Arc<Notify>,
    running: Arc<AtomicBool>,
}

impl ControlServer {
    /// Create a server with an empty in-memory launch table.
    pub fn new(config: ControlConfig) -> Result<Self, ServerError> {
        Self::with_launcher(config, Arc::new(InMemoryLauncher::new()))
    }

    pub fn with_launcher(
        config: ControlConfig,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Result<Self, ServerError> {
        config
            .validate()
            .map_err(|e| ServerError::Config(e.to_string()))?;

        Ok(Self {
            state: Arc::new(AppState::new(config, launcher)),
            stop: Arc::new(Notify::new()),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    /// Router with every route, CORS and request tracing.
    pub fn router(&self) -> Router {
        Router::new()
            .merge(routes::ws_routes())
            .merge(routes::api_routes())
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            )
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = self.state.config.listen_addr();
        TcpListener::bind(&addr)
            .await
            .map_err(|e| ServerError::Bind(format!("{}: {}", addr, e)))
    }

    /// Bind and serve until [`ControlServer::stop`] is called.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until stopped.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServerError::AlreadyRunning);
        }

        let addr: SocketAddr = listener.local_addr()?;
        info!("Control server listening on {}", addr);
        info!("  WebSocket: ws://{}/ws", addr);
        info!("  REST API:  http://{}/health", addr);

        self.spawn_retention_sweeper();

        let stop = self.stop.clone();
        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { stop.notified().await })
            .await;

        self.running.store(false, Ordering::SeqCst);
        info!("Control server stopped");
        result.map_err(ServerError::from)
    }

    /// Drain every instance connection.
    pub async fn drain(&self) -> Result<DrainReport, ShutdownError> {
        self.state.shutdown.drain().await
    }

    /// Stop the HTTP listener and the sweeper.
    pub fn stop(&self) {
        self.stop.notify_waiters();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Periodically drop finished cameras and abandoned requests.
    fn spawn_retention_sweeper(&self) {
        let interval = self.state.config.retention_interval();
        if interval.is_zero() {
            debug!("Retention sweeper disabled");
            return;
        }

        let state = self.state.clone();
        let stop = self.stop.clone();
        tokio::spawn(async move {
            let retention = state.config.camera_retention();
            let request_ttl = state.config.pending_request_ttl();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let pruned = state.allocator.prune_finished(retention);
                        let expired = state.tracker.expire(request_ttl);
                        if pruned > 0 || expired > 0 {
                            info!(
                                "Retention sweep: {} cameras pruned, {} requests expired",
                                pruned, expired
                            );
                        }
                    }
                    _ = stop.notified() => {
                        debug!("Retention sweeper shutting down");
                        break;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = ControlConfig::default();
        config.outbound_buffer = 0;
        assert!(matches!(
            ControlServer::new(config),
            Err(ServerError::Config(_))
        ));
    }

    #[test]
    fn test_state_is_wired() {
        let server = ControlServer::new(ControlConfig::default()).unwrap();
        let state = server.state();
        assert_eq!(state.allocator.instance_count(), 0);
        assert!(state.registry.is_empty());
        assert!(state.tracker.is_empty());
        assert!(state.launcher.records().is_empty());
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_serve_and_stop() {
        let mut config = ControlConfig::default();
        config.bind_address = "127.0.0.1".into();
        config.port = 0;
        let server = ControlServer::new(config).unwrap();
        let listener = server.bind().await.unwrap();

        let handle = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };
        while !server.is_running() {
            tokio::task::yield_now().await;
        }
        // Give serve a moment to park on the stop signal.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        server.stop();
        handle.await.unwrap().unwrap();
        assert!(!server.is_running());
    }
}
