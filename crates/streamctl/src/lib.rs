// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # streamctl
//!
//! Control plane for a fleet of video-analytics worker instances.
//!
//! Instances connect over WebSocket, identify themselves with `app_ready`
//! and receive camera analysis jobs. The control plane keeps the live
//! picture of every instance (streams, cameras, files, metrics) and
//! exposes it over a small REST API.
//!
//! ## Example
//!
//! ```rust,no_run
//! use streamctl::{ControlConfig, ControlServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = ControlServer::new(ControlConfig::default())?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod allocator;
pub mod config;
pub mod engine;
pub mod handlers;
pub mod launcher;
pub mod protocol;
pub mod reconnect;
pub mod registry;
pub mod routes;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod tracker;

pub use allocator::Allocator;
pub use config::{ConfigError, ControlConfig, ShutdownConfig};
pub use engine::{ProtocolEngine, StartOutcome};
pub use launcher::{InMemoryLauncher, LaunchRecord, ProcessLauncher};
pub use protocol::{DecodeError, InboundMessage, OutboundMessage};
pub use registry::{ConnectionRegistry, SendError};
pub use server::{AppState, ControlServer, ServerError};
pub use shutdown::{DrainReport, ShutdownError, ShutdownOrchestrator};
