// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Graceful drain of all instance connections.
//!
//! 1. New connections are refused (close code 1013).
//! 2. Unauthenticated connections are closed right away with 1001.
//! 3. Every authenticated instance gets `terminate_app`; each waits for its
//!    `app_terminated` up to the ack timeout, all under one deadline.
//! 4. After a grace period, whatever is left is closed with 1001.
//!
//! Timeouts only produce warnings; the drain always runs to the end.

use crate::config::ShutdownConfig;
use crate::engine::ProtocolEngine;
use crate::protocol::close_code;
use crate::registry::{short, ConnectionInfo, ConnectionRegistry};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{timeout_at, Instant};
use tracing::{info, warn};

const SHUTDOWN_REASON: &str = "Server shutting down";

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("Shutdown already in progress")]
    AlreadyDraining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownPhase {
    Running,
    Draining,
    Drained,
}

/// Outcome of one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Instances that answered `terminate_app` with `OK`
    pub acknowledged: usize,
    /// Instances that did not acknowledge in time, or could not be reached
    pub failed: usize,
    /// Connections closed before they completed a handshake
    pub unauthenticated_closed: usize,
    /// Connections still open after the grace period
    pub forced: usize,
}

pub struct ShutdownOrchestrator {
    registry: Arc<ConnectionRegistry>,
    engine: Arc<ProtocolEngine>,
    config: ShutdownConfig,
    phase: Mutex<ShutdownPhase>,
}

impl ShutdownOrchestrator {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        engine: Arc<ProtocolEngine>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            registry,
            engine,
            config,
            phase: Mutex::new(ShutdownPhase::Running),
        }
    }

    pub fn phase(&self) -> ShutdownPhase {
        *self.phase.lock()
    }

    /// Drain every connection. Rejected while another drain runs.
    pub async fn drain(&self) -> Result<DrainReport, ShutdownError> {
        {
            let mut phase = self.phase.lock();
            if *phase == ShutdownPhase::Draining {
                return Err(ShutdownError::AlreadyDraining);
            }
            *phase = ShutdownPhase::Draining;
        }
        self.registry.set_shutting_down(true);

        let mut report = DrainReport::default();
        let (authenticated, unauthenticated): (Vec<ConnectionInfo>, Vec<ConnectionInfo>) = self
            .registry
            .snapshot()
            .into_iter()
            .partition(|c| c.authenticated && c.instance_id.is_some());

        info!(
            "Draining {} connections ({} authenticated)",
            authenticated.len() + unauthenticated.len(),
            authenticated.len()
        );

        for conn in &unauthenticated {
            if self
                .registry
                .close(&conn.connection_id, close_code::GOING_AWAY, SHUTDOWN_REASON)
                .await
            {
                report.unauthenticated_closed += 1;
            }
        }

        let deadline = Instant::now() + self.config.drain_deadline();
        let drains = authenticated.iter().map(|conn| async move {
            match timeout_at(deadline, self.drain_connection(conn)).await {
                Ok(acknowledged) => acknowledged,
                Err(_) => {
                    warn!("[{}] Drain deadline reached", short(&conn.connection_id));
                    false
                }
            }
        });
        for acknowledged in join_all(drains).await {
            if acknowledged {
                report.acknowledged += 1;
            } else {
                report.failed += 1;
            }
        }
        info!(
            "Terminate phase done: {} acknowledged, {} failed, {} unauthenticated closed",
            report.acknowledged, report.failed, report.unauthenticated_closed
        );

        tokio::time::sleep(self.config.grace_period()).await;

        report.forced = self.force_close_remaining().await;
        if report.forced > 0 {
            warn!("Force-closed {} connections", report.forced);
        }

        self.registry.set_shutting_down(false);
        *self.phase.lock() = ShutdownPhase::Drained;
        info!("Drain complete: {:?}", report);
        Ok(report)
    }

    /// Terminate one instance, then close its connection.
    async fn drain_connection(&self, conn: &ConnectionInfo) -> bool {
        if conn.instance_id.is_none() {
            return false;
        }

        let acknowledged = match self
            .engine
            .request_terminate(&conn.connection_id, self.config.ack_timeout())
            .await
        {
            Ok(acknowledged) => acknowledged,
            Err(e) => {
                warn!("[{}] Terminate not sent: {}", short(&conn.connection_id), e);
                false
            }
        };

        // Already gone if the instance closed after acknowledging.
        self.registry
            .close(&conn.connection_id, close_code::GOING_AWAY, SHUTDOWN_REASON)
            .await;
        acknowledged
    }

    async fn force_close_remaining(&self) -> usize {
        let remaining = self.registry.snapshot();
        if remaining.is_empty() {
            return 0;
        }

        let deadline = Instant::now() + self.config.force_close_timeout();
        let closes = remaining.iter().map(|conn| async move {
            timeout_at(
                deadline,
                self.registry
                    .close(&conn.connection_id, close_code::GOING_AWAY, SHUTDOWN_REASON),
            )
            .await
            // The entry is released before the frame is queued, so a
            // timed out close still counts.
            .unwrap_or(true)
        });
        join_all(closes).await.into_iter().filter(|closed| *closed).count()
    }
}
