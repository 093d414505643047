// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! WebSocket session of one analytics instance.
//!
//! Each accepted socket gets an InstanceSession that:
//! - registers the connection (or refuses it during shutdown)
//! - forwards queued frames to the socket from a dedicated task
//! - feeds every received text frame to the protocol engine, in order

use crate::engine::ProtocolEngine;
use crate::registry::{short, ConnectionGuard, ConnectionRegistry, Outgoing};
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// A WebSocket session with one instance
pub struct InstanceSession {
    engine: Arc<ProtocolEngine>,
    registry: Arc<ConnectionRegistry>,
    outbound_buffer: usize,
}

impl InstanceSession {
    pub fn new(
        engine: Arc<ProtocolEngine>,
        registry: Arc<ConnectionRegistry>,
        outbound_buffer: usize,
    ) -> Self {
        Self {
            engine,
            registry,
            outbound_buffer,
        }
    }

    /// Run the session until either side closes
    pub async fn run(self, socket: WebSocket) {
        let (mut ws_tx, mut ws_rx) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Outgoing>(self.outbound_buffer);

        let Some(connection_id) = self.registry.accept(tx) else {
            // Refused: deliver the queued close frame and leave.
            while let Some(frame) = rx.recv().await {
                if !write_frame(&mut ws_tx, frame).await {
                    break;
                }
            }
            return;
        };

        // Spawn task to forward queued frames to the WebSocket
        let log_id = short(&connection_id).to_string();
        let mut forward = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if !write_frame(&mut ws_tx, frame).await {
                    debug!("[{}] Forwarder stopped", log_id);
                    break;
                }
            }
        });

        let guard = ConnectionGuard::new(self.registry.clone(), connection_id);
        let id = short(guard.id()).to_string();

        loop {
            tokio::select! {
                msg = ws_rx.next() => {
                    let Some(msg) = msg else {
                        debug!("[{}] Stream ended", id);
                        break;
                    };
                    match msg {
                        Ok(Message::Text(text)) => {
                            self.engine.handle_frame(guard.id(), &text).await;
                        }
                        Ok(Message::Close(frame)) => {
                            info!(
                                "[{}] Instance closed connection ({:?})",
                                id,
                                frame.map(|f| f.code)
                            );
                            break;
                        }
                        Ok(Message::Ping(_)) => {
                            // Axum handles pong automatically
                        }
                        Ok(Message::Pong(_)) => {
                            debug!("[{}] Pong received", id);
                        }
                        Ok(Message::Binary(_)) => {
                            warn!("[{}] Binary messages not supported", id);
                        }
                        Err(e) => {
                            error!("[{}] WebSocket error: {}", id, e);
                            break;
                        }
                    }
                }
                _ = &mut forward => {
                    // A close frame went out, or the socket is unwritable.
                    debug!("[{}] Outbound side finished", id);
                    break;
                }
            }
        }

        drop(guard);
        forward.abort();
        info!("[{}] Session ended", id);
    }
}

/// Write one frame. Returns `false` once nothing more should be written.
async fn write_frame(ws_tx: &mut SplitSink<WebSocket, Message>, frame: Outgoing) -> bool {
    match frame {
        Outgoing::Text(text) => ws_tx.send(Message::Text(text)).await.is_ok(),
        Outgoing::Close { code, reason } => {
            let close = Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            }));
            let _ = ws_tx.send(close).await;
            false
        }
    }
}
