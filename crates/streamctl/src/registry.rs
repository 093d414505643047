// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Live WebSocket connections and their instance bindings.
//!
//! A connection is registered when the socket is accepted and removed when
//! its receive loop exits, whatever the exit path. It is bound to an
//! instance id at most once, on a successful `app_ready`.
//!
//! Frames never go to the socket directly: each connection owns an mpsc
//! sender drained by a forwarder task that holds the socket sink.

use crate::allocator::model::TransportStatus;
use crate::allocator::Allocator;
use crate::protocol::{close_code, encode, OutboundMessage};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type ConnectionId = String;

/// Frame queued for a connection's forwarder task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// Encoded JSON text frame
    Text(String),
    /// Close frame; the forwarder stops after sending it
    Close { code: u16, reason: String },
}

/// Outbound delivery failures.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("Instance '{0}' has no authenticated connection")]
    NotConnected(String),

    #[error("Connection {0} is closed")]
    ChannelClosed(ConnectionId),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

struct Connection {
    instance_id: Option<String>,
    authenticated: bool,
    connected_at: DateTime<Utc>,
    tx: mpsc::Sender<Outgoing>,
}

/// Public view of a live connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub instance_id: Option<String>,
    pub authenticated: bool,
    pub connected_at: DateTime<Utc>,
}

/// History entry for a closed connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionRecord {
    pub connection_id: ConnectionId,
    pub instance_id: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

/// Registry of live connections.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Connection>,
    history: Mutex<VecDeque<ConnectionRecord>>,
    history_capacity: usize,
    shutting_down: AtomicBool,
    allocator: Arc<Allocator>,
}

impl ConnectionRegistry {
    pub fn new(allocator: Arc<Allocator>, history_capacity: usize) -> Self {
        Self {
            connections: DashMap::new(),
            history: Mutex::new(VecDeque::with_capacity(history_capacity)),
            history_capacity,
            shutting_down: AtomicBool::new(false),
            allocator,
        }
    }

    /// Register a freshly accepted connection.
    ///
    /// While shutting down, the connection is told to come back later
    /// (close code 1013) and `None` is returned.
    pub fn accept(&self, tx: mpsc::Sender<Outgoing>) -> Option<ConnectionId> {
        if self.is_shutting_down() {
            let _ = tx.try_send(Outgoing::Close {
                code: close_code::TRY_AGAIN_LATER,
                reason: "Server shutting down".to_string(),
            });
            info!("Connection rejected: shutdown in progress");
            return None;
        }

        let id = Uuid::new_v4().to_string();
        self.connections.insert(
            id.clone(),
            Connection {
                instance_id: None,
                authenticated: false,
                connected_at: Utc::now(),
                tx,
            },
        );
        info!("[{}] Connection accepted. Total: {}", short(&id), self.len());
        Some(id)
    }

    /// Bind a connection to an instance. Only the first bind succeeds.
    pub fn bind(&self, connection_id: &str, instance_id: &str) -> bool {
        let Some(mut conn) = self.connections.get_mut(connection_id) else {
            return false;
        };
        if conn.instance_id.is_some() {
            warn!(
                "[{}] Already bound to '{}', ignoring bind to '{}'",
                short(connection_id),
                conn.instance_id.as_deref().unwrap_or_default(),
                instance_id
            );
            return false;
        }
        conn.instance_id = Some(instance_id.to_string());
        conn.authenticated = true;
        info!("[{}] Bound to instance '{}'", short(connection_id), instance_id);
        true
    }

    /// Instance bound to a connection, if any.
    pub fn instance_of(&self, connection_id: &str) -> Option<String> {
        self.connections
            .get(connection_id)
            .and_then(|c| c.instance_id.clone())
    }

    /// Authenticated connection of an instance. The newest one wins when a
    /// reconnect overlaps the old session.
    pub fn connection_for(&self, instance_id: &str) -> Option<ConnectionId> {
        self.connections
            .iter()
            .filter(|e| e.authenticated && e.instance_id.as_deref() == Some(instance_id))
            .max_by_key(|e| e.connected_at)
            .map(|e| e.key().clone())
    }

    /// Queue a message on a connection.
    pub async fn send(&self, connection_id: &str, msg: &OutboundMessage) -> Result<(), SendError> {
        let text = encode(msg)?;
        let tx = self
            .sender(connection_id)
            .ok_or_else(|| SendError::ChannelClosed(connection_id.to_string()))?;

        debug!("[{}] -> {:?}", short(connection_id), msg.kind());
        tx.send(Outgoing::Text(text))
            .await
            .map_err(|_| SendError::ChannelClosed(connection_id.to_string()))
    }

    /// Queue a message on the authenticated connection of an instance.
    pub async fn send_to_instance(
        &self,
        instance_id: &str,
        msg: &OutboundMessage,
    ) -> Result<ConnectionId, SendError> {
        let connection_id = self
            .connection_for(instance_id)
            .ok_or_else(|| SendError::NotConnected(instance_id.to_string()))?;
        self.send(&connection_id, msg).await?;
        Ok(connection_id)
    }

    /// Send a close frame and release the connection.
    ///
    /// No-op if the connection is already gone.
    pub async fn close(&self, connection_id: &str, code: u16, reason: &str) -> bool {
        let Some(tx) = self.sender(connection_id) else {
            return false;
        };
        self.release(connection_id);

        let frame = Outgoing::Close {
            code,
            reason: reason.to_string(),
        };
        if tx.send(frame).await.is_err() {
            debug!("[{}] Forwarder already gone", short(connection_id));
        }
        info!("[{}] Closed with code {}", short(connection_id), code);
        true
    }

    /// Remove a connection and record it in the history.
    ///
    /// If it was bound and no newer connection serves the same instance,
    /// the instance transport is marked disconnected.
    pub fn release(&self, connection_id: &str) -> Option<ConnectionRecord> {
        let (id, conn) = self.connections.remove(connection_id)?;

        let record = ConnectionRecord {
            connection_id: id,
            instance_id: conn.instance_id,
            connected_at: conn.connected_at,
            closed_at: Utc::now(),
        };

        {
            let mut history = self.history.lock();
            if history.len() >= self.history_capacity {
                history.pop_front();
            }
            history.push_back(record.clone());
        }

        if let Some(instance_id) = &record.instance_id {
            if self.connection_for(instance_id).is_none() {
                self.allocator.update_instance_status(
                    instance_id,
                    None,
                    Some(TransportStatus::Disconnected),
                );
            }
        }

        info!(
            "[{}] Connection released. Total: {}",
            short(connection_id),
            self.len()
        );
        Some(record)
    }

    /// Instance ids with an authenticated connection, sorted.
    pub fn connected_instances(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .connections
            .iter()
            .filter(|e| e.authenticated)
            .filter_map(|e| e.instance_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self
            .connections
            .iter()
            .map(|e| ConnectionInfo {
                connection_id: e.key().clone(),
                instance_id: e.instance_id.clone(),
                authenticated: e.authenticated,
                connected_at: e.connected_at,
            })
            .collect();
        infos.sort_by_key(|c| c.connected_at);
        infos
    }

    /// Closed connections, oldest first.
    pub fn history(&self) -> Vec<ConnectionRecord> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub(crate) fn set_shutting_down(&self, value: bool) {
        self.shutting_down.store(value, Ordering::SeqCst);
    }

    fn sender(&self, connection_id: &str) -> Option<mpsc::Sender<Outgoing>> {
        self.connections.get(connection_id).map(|c| c.tx.clone())
    }
}

/// Releases a connection when the receive loop exits.
pub struct ConnectionGuard {
    registry: Arc<ConnectionRegistry>,
    connection_id: ConnectionId,
}

impl ConnectionGuard {
    pub fn new(registry: Arc<ConnectionRegistry>, connection_id: ConnectionId) -> Self {
        Self {
            registry,
            connection_id,
        }
    }

    pub fn id(&self) -> &str {
        &self.connection_id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.release(&self.connection_id);
    }
}

/// Shortened id for log lines.
pub(crate) fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::model::InstanceStatus;

    fn registry() -> (Arc<Allocator>, Arc<ConnectionRegistry>) {
        let allocator = Arc::new(Allocator::new());
        let registry = Arc::new(ConnectionRegistry::new(allocator.clone(), 3));
        (allocator, registry)
    }

    fn accept(registry: &ConnectionRegistry) -> (ConnectionId, mpsc::Receiver<Outgoing>) {
        let (tx, rx) = mpsc::channel(8);
        (registry.accept(tx).unwrap(), rx)
    }

    #[test]
    fn test_bind_only_once() {
        let (_, registry) = registry();
        let (id, _rx) = accept(&registry);

        assert_eq!(registry.connection_for("A"), None);
        assert!(registry.bind(&id, "A"));
        assert!(!registry.bind(&id, "B"));
        assert_eq!(registry.instance_of(&id).as_deref(), Some("A"));
        assert_eq!(registry.connection_for("A"), Some(id));
        assert_eq!(registry.connected_instances(), vec!["A".to_string()]);
    }

    #[test]
    fn test_accept_rejected_while_shutting_down() {
        let (_, registry) = registry();
        registry.set_shutting_down(true);

        let (tx, mut rx) = mpsc::channel(1);
        assert!(registry.accept(tx).is_none());
        assert!(registry.is_empty());
        assert_eq!(
            rx.try_recv().unwrap(),
            Outgoing::Close {
                code: close_code::TRY_AGAIN_LATER,
                reason: "Server shutting down".into()
            }
        );
    }

    #[test]
    fn test_release_marks_instance_disconnected() {
        let (allocator, registry) = registry();
        allocator.register_instance("A", "/cfg", 1);
        allocator.update_instance_status(
            "A",
            Some(InstanceStatus::Idle),
            Some(TransportStatus::Connected),
        );

        let (id, _rx) = accept(&registry);
        registry.bind(&id, "A");
        {
            let _guard = ConnectionGuard::new(registry.clone(), id.clone());
        }

        assert!(registry.is_empty());
        let info = allocator.instance_info("A").unwrap();
        assert_eq!(info.ws_status, TransportStatus::Disconnected);
        assert_eq!(registry.history().len(), 1);
        assert_eq!(registry.history()[0].instance_id.as_deref(), Some("A"));

        // Second release is a no-op
        assert!(registry.release(&id).is_none());
        assert_eq!(registry.history().len(), 1);
    }

    #[test]
    fn test_release_keeps_newer_session_connected() {
        let (allocator, registry) = registry();
        allocator.register_instance("A", "/cfg", 1);
        allocator.update_instance_status("A", None, Some(TransportStatus::Connected));

        let (old, _rx1) = accept(&registry);
        registry.bind(&old, "A");
        std::thread::sleep(std::time::Duration::from_millis(2));
        let (new, _rx2) = accept(&registry);
        registry.bind(&new, "A");

        registry.release(&old);
        assert_eq!(registry.connection_for("A"), Some(new));
        assert_eq!(
            allocator.instance_info("A").unwrap().ws_status,
            TransportStatus::Connected
        );
    }

    #[test]
    fn test_history_is_bounded() {
        let (_, registry) = registry();
        let mut ids = Vec::new();
        for _ in 0..5 {
            let (id, _rx) = accept(&registry);
            registry.release(&id);
            ids.push(id);
        }
        let history = registry.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].connection_id, ids[2]);
        assert_eq!(history[2].connection_id, ids[4]);
    }

    #[tokio::test]
    async fn test_send_to_instance() {
        let (_, registry) = registry();
        let (id, mut rx) = accept(&registry);

        let msg = OutboundMessage::QueryMetrics {
            request_id: "q".into(),
        };
        assert!(matches!(
            registry.send_to_instance("A", &msg).await,
            Err(SendError::NotConnected(_))
        ));

        registry.bind(&id, "A");
        assert_eq!(registry.send_to_instance("A", &msg).await.unwrap(), id);
        match rx.recv().await.unwrap() {
            Outgoing::Text(text) => assert!(text.contains("query_metrics")),
            other => panic!("Expected text frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_sends_frame_and_releases() {
        let (_, registry) = registry();
        let (id, mut rx) = accept(&registry);

        assert!(registry.close(&id, close_code::GOING_AWAY, "bye").await);
        assert!(registry.is_empty());
        assert_eq!(
            rx.recv().await.unwrap(),
            Outgoing::Close {
                code: close_code::GOING_AWAY,
                reason: "bye".into()
            }
        );

        assert!(!registry.close(&id, close_code::GOING_AWAY, "again").await);
    }

    #[tokio::test]
    async fn test_send_after_forwarder_gone() {
        let (_, registry) = registry();
        let (id, rx) = accept(&registry);
        drop(rx);

        let msg = OutboundMessage::TerminateApp {
            request_id: "t".into(),
        };
        assert!(matches!(
            registry.send(&id, &msg).await,
            Err(SendError::ChannelClosed(_))
        ));
    }
}
