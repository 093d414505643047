// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Protocol engine: inbound dispatch and outbound requests.
//!
//! Inbound frames are decoded and dispatched with an exhaustive match.
//! A bad frame is logged and dropped; the connection stays open. Except
//! for `app_ready`, messages are only acted upon once the connection is
//! bound to an instance.
//!
//! Outbound requests go to the authenticated connection of the target
//! instance and are recorded in the request tracker under a fresh id.

use crate::allocator::model::{CameraRequest, InstanceStatus, MetricsSnapshot, TransportStatus};
use crate::allocator::Allocator;
use crate::launcher::ProcessLauncher;
use crate::protocol::{
    self, close_code, AnalysisComplete, AnalysisInterrupted, AnalysisStarted,
    AnalysisStatusReport, AppReady, AppTerminated, CameraId, ExecuteAck, FileDescriptor,
    InboundMessage, InterruptAnalysis, MetricsResponse, OutboundMessage, PushAck, PushFile,
    StartAnalysis, StreamId,
};
use crate::reconnect::ReconnectManager;
use crate::registry::{short, ConnectionRegistry, SendError};
use crate::tracker::RequestTracker;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Result of submitting a camera job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// Running on the slot; `start_analysis` was sent
    Started { request_id: String },
    /// Waiting behind the camera that holds the slot
    Queued,
    /// Unknown instance or slot, or the camera is already active
    Rejected,
}

/// Per-message handling shared by all connections.
pub struct ProtocolEngine {
    allocator: Arc<Allocator>,
    registry: Arc<ConnectionRegistry>,
    tracker: Arc<RequestTracker>,
    reconnect: Arc<ReconnectManager>,
    launcher: Arc<dyn ProcessLauncher>,
}

impl ProtocolEngine {
    pub fn new(
        allocator: Arc<Allocator>,
        registry: Arc<ConnectionRegistry>,
        tracker: Arc<RequestTracker>,
        reconnect: Arc<ReconnectManager>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        Self {
            allocator,
            registry,
            tracker,
            reconnect,
            launcher,
        }
    }

    // ---------------------------------------------------------------------
    // Inbound
    // ---------------------------------------------------------------------

    /// Decode and handle one text frame.
    pub async fn handle_frame(&self, connection_id: &str, text: &str) {
        match protocol::decode(text) {
            Ok(msg) => self.dispatch(connection_id, msg).await,
            Err(e) => warn!("[{}] Dropping frame: {}", short(connection_id), e),
        }
    }

    pub async fn dispatch(&self, connection_id: &str, msg: InboundMessage) {
        debug!(
            "[{}] <- {:?} ({})",
            short(connection_id),
            msg.kind(),
            msg.request_id()
        );

        let msg = match msg {
            InboundMessage::AppReady(m) => {
                self.handle_app_ready(connection_id, m).await;
                return;
            }
            other => other,
        };

        let Some(instance_id) = self.registry.instance_of(connection_id) else {
            warn!(
                "[{}] {:?} before app_ready, ignored",
                short(connection_id),
                msg.kind()
            );
            return;
        };

        self.tracker.resolve(&msg);

        match msg {
            // Handled before the binding check
            InboundMessage::AppReady(_) => {}
            InboundMessage::AnalysisStarted(m) => self.on_analysis_started(&instance_id, &m),
            InboundMessage::PushAck(m) => self.on_push_ack(&instance_id, &m),
            InboundMessage::ProcessingStarted(m) => {
                if !self.allocator.start_file(&instance_id, m.camera_id, m.file_id) {
                    warn!(
                        "Unknown file {} on camera_{} ({})",
                        m.file_id, m.camera_id, instance_id
                    );
                }
                info!("Processing started: {}", m.current_file);
            }
            InboundMessage::FileDone(m) => {
                if !self.allocator.complete_file(&instance_id, m.camera_id, m.file_id) {
                    warn!(
                        "Unknown file {} on camera_{} ({})",
                        m.file_id, m.camera_id, instance_id
                    );
                }
                info!("File done: {}", m.processed_file);
            }
            InboundMessage::AnalysisComplete(m) => {
                self.on_analysis_complete(&instance_id, &m).await;
            }
            InboundMessage::AnalysisInterrupted(m) => {
                self.on_analysis_interrupted(&instance_id, &m);
            }
            InboundMessage::AppTerminated(m) => {
                self.on_app_terminated(connection_id, &instance_id, &m).await;
            }
            InboundMessage::MetricsResponse(m) => self.on_metrics(&instance_id, &m),
            InboundMessage::AnalysisStatus(m) => self.on_analysis_status(&instance_id, &m),
        }
    }

    async fn handle_app_ready(&self, connection_id: &str, msg: AppReady) {
        let instance_id = msg.instance_id.as_str();
        let bound = self.registry.instance_of(connection_id);
        let config_verified = match bound.as_deref() {
            _ if instance_id.is_empty() => false,
            Some(other) if other != instance_id => {
                warn!(
                    "[{}] app_ready for '{}' on a connection bound to '{}'",
                    short(connection_id),
                    instance_id,
                    other
                );
                false
            }
            _ => true,
        };

        if config_verified {
            if bound.is_none() {
                self.registry.bind(connection_id, instance_id);
            }

            self.allocator.ensure_instance(
                instance_id,
                &msg.config_path,
                msg.streams_count as usize,
            );
            self.allocator.update_instance_status(
                instance_id,
                Some(InstanceStatus::Idle),
                Some(TransportStatus::Connected),
            );
            self.launcher.set_container_pid(instance_id, msg.process_id);
        }

        let streams_count_verified = match self.launcher.lookup(instance_id) {
            Some(record) => {
                let ok = record.verify_streams_count(msg.streams_count);
                if !ok {
                    error!(
                        "Streams count mismatch for '{}': expected {:?}, reported {}",
                        instance_id, record.streams_count, msg.streams_count
                    );
                }
                ok
            }
            None => {
                warn!("No launch record for '{}'", instance_id);
                false
            }
        };

        let mut ack = ExecuteAck::verified(
            &msg.request_id,
            instance_id,
            config_verified,
            streams_count_verified,
        );
        if config_verified && msg.is_reconnection() {
            let restored = self.reconnect.handle_reconnection(&msg);
            ack = ack.reconnection(restored);
        }

        let status = ack.status;
        if let Err(e) = self
            .registry
            .send(connection_id, &OutboundMessage::ExecuteAck(ack))
            .await
        {
            error!("[{}] Failed to send execute_ack: {}", short(connection_id), e);
            return;
        }
        info!(
            "[{}] Handshake from '{}' answered ({:?})",
            short(connection_id),
            instance_id,
            status
        );
    }

    fn on_analysis_started(&self, instance_id: &str, m: &AnalysisStarted) {
        if m.status.is_ok() {
            info!(
                "Analysis started on '{}': stream_{}, camera_{}",
                instance_id, m.stream_id, m.camera_id
            );
        } else {
            warn!(
                "Analysis start failed on '{}' (camera_{}): {}",
                instance_id,
                m.camera_id,
                m.error_reason.as_deref().unwrap_or("no reason given")
            );
        }
    }

    fn on_push_ack(&self, instance_id: &str, m: &PushAck) {
        if m.status.is_ok() {
            info!(
                "Files accepted by '{}': stream_{}, camera_{}",
                instance_id, m.stream_id, m.camera_id
            );
        } else {
            warn!(
                "Push rejected by '{}' (camera_{}): {}",
                instance_id,
                m.camera_id,
                m.error_reason.as_deref().unwrap_or("no reason given")
            );
        }
    }

    async fn on_analysis_complete(&self, instance_id: &str, m: &AnalysisComplete) {
        info!(
            "Analysis complete on '{}': camera_{}, {} files ({})",
            instance_id, m.camera_id, m.processed_count, m.message
        );

        let Some(outcome) = self.allocator.complete_camera(instance_id, m.camera_id) else {
            warn!("Unknown camera_{} on '{}'", m.camera_id, instance_id);
            return;
        };

        if let Some(next) = outcome.promoted {
            self.start_promoted(instance_id, outcome.stream_id, next).await;
        }
    }

    fn on_analysis_interrupted(&self, instance_id: &str, m: &AnalysisInterrupted) {
        if !m.status.is_ok() {
            warn!(
                "Interrupt failed on '{}' (camera_{}): {}",
                instance_id,
                m.camera_id,
                m.error_reason.as_deref().unwrap_or("no reason given")
            );
            return;
        }
        if !self.allocator.interrupt_analysis(instance_id, m.camera_id) {
            warn!("Unknown camera_{} on '{}'", m.camera_id, instance_id);
        }
    }

    async fn on_app_terminated(&self, connection_id: &str, instance_id: &str, m: &AppTerminated) {
        if !m.acknowledged() {
            warn!(
                "'{}' answered terminate with status '{}': {}",
                instance_id, m.status, m.message
            );
        }
        self.allocator.update_instance_status(
            instance_id,
            Some(InstanceStatus::Disconnected),
            Some(TransportStatus::Disconnected),
        );
        self.launcher.mark_stopped(instance_id);
        self.registry
            .close(connection_id, close_code::NORMAL, "Application terminated")
            .await;
        info!("Instance '{}' terminated", instance_id);
    }

    fn on_metrics(&self, instance_id: &str, m: &MetricsResponse) {
        let snapshot = MetricsSnapshot {
            cpu_percent: m.cpu_percent,
            ram_mb: m.ram_mb,
            gpu_percent: m.gpu_percent,
            vram_mb: m.vram_mb,
            recorded_at: Utc::now(),
        };
        self.allocator.update_metrics(instance_id, snapshot);
        debug!("Metrics updated for '{}'", instance_id);
    }

    fn on_analysis_status(&self, instance_id: &str, m: &AnalysisStatusReport) {
        let streams = m.streams.as_ref().map_or(0, Vec::len);
        debug!(
            "Analysis status from '{}' ({} streams, stream: {}, camera: {})",
            instance_id,
            streams,
            m.stream.is_some(),
            m.camera.is_some()
        );
    }

    /// Hand a promoted camera to its instance.
    async fn start_promoted(&self, instance_id: &str, stream_id: StreamId, camera_id: CameraId) {
        let Some(camera) = self.allocator.camera(instance_id, camera_id) else {
            return;
        };
        if let Err(e) = self
            .start_analysis(instance_id, stream_id, &camera.request())
            .await
        {
            error!("Failed to start promoted camera_{}: {}", camera_id, e);
            // The instance never got the job; free the slot again.
            self.allocator.interrupt_analysis(instance_id, camera_id);
            return;
        }

        let files: Vec<FileDescriptor> = camera.files.iter().map(|f| f.descriptor()).collect();
        if !files.is_empty() {
            if let Err(e) = self.push_files(instance_id, stream_id, camera_id, &files).await {
                error!("Failed to push files of camera_{}: {}", camera_id, e);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Outbound
    // ---------------------------------------------------------------------

    /// Track and send a request. The tracker entry is dropped if sending
    /// fails.
    async fn send_request(
        &self,
        instance_id: &str,
        msg: OutboundMessage,
    ) -> Result<oneshot::Receiver<InboundMessage>, SendError> {
        let request_id = msg.request_id().to_string();
        let rx = self.tracker.register(&request_id, instance_id, msg.kind());
        if let Err(e) = self.registry.send_to_instance(instance_id, &msg).await {
            self.tracker.abandon(&request_id);
            return Err(e);
        }
        Ok(rx)
    }

    pub async fn start_analysis(
        &self,
        instance_id: &str,
        stream_id: StreamId,
        camera: &CameraRequest,
    ) -> Result<String, SendError> {
        let request_id = new_request_id();
        let msg = OutboundMessage::StartAnalysis(StartAnalysis {
            request_id: request_id.clone(),
            stream_id,
            camera_id: camera.camera_id,
            camera_type: camera.camera_type,
            path: camera.path.clone(),
            name: camera.name.clone(),
            output_dir: camera.output_dir.clone(),
        });
        self.send_request(instance_id, msg).await?;
        info!(
            "start_analysis sent to '{}': stream_{}, camera_{}",
            instance_id, stream_id, camera.camera_id
        );
        Ok(request_id)
    }

    /// Send `files` as one batch closed by an EOS item.
    pub async fn push_files(
        &self,
        instance_id: &str,
        stream_id: StreamId,
        camera_id: CameraId,
        files: &[FileDescriptor],
    ) -> Result<String, SendError> {
        let request_id = new_request_id();
        let msg =
            OutboundMessage::PushFile(PushFile::new(&request_id, stream_id, camera_id, files));
        self.send_request(instance_id, msg).await?;
        info!(
            "push_file sent to '{}': camera_{}, {} files",
            instance_id,
            camera_id,
            files.len()
        );
        Ok(request_id)
    }

    pub async fn interrupt_analysis(
        &self,
        instance_id: &str,
        stream_id: StreamId,
        camera_id: CameraId,
        reason: Option<String>,
    ) -> Result<String, SendError> {
        let request_id = new_request_id();
        let msg = OutboundMessage::InterruptAnalysis(InterruptAnalysis {
            request_id: request_id.clone(),
            stream_id,
            camera_id,
            reason: reason.unwrap_or_else(protocol::default_interrupt_reason),
        });
        self.send_request(instance_id, msg).await?;
        info!(
            "interrupt_analysis sent to '{}': camera_{}",
            instance_id, camera_id
        );
        Ok(request_id)
    }

    pub async fn terminate_app(&self, instance_id: &str) -> Result<String, SendError> {
        let request_id = new_request_id();
        let msg = OutboundMessage::TerminateApp {
            request_id: request_id.clone(),
        };
        self.send_request(instance_id, msg).await?;
        info!("terminate_app sent to '{}'", instance_id);
        Ok(request_id)
    }

    pub async fn query_metrics(&self, instance_id: &str) -> Result<String, SendError> {
        let request_id = new_request_id();
        let msg = OutboundMessage::QueryMetrics {
            request_id: request_id.clone(),
        };
        self.send_request(instance_id, msg).await?;
        debug!("query_metrics sent to '{}'", instance_id);
        Ok(request_id)
    }

    pub async fn query_analysis_status(
        &self,
        instance_id: &str,
        stream_id: Option<StreamId>,
        camera_id: Option<CameraId>,
    ) -> Result<String, SendError> {
        let request_id = new_request_id();
        let msg = OutboundMessage::QueryAnalysisStatus {
            request_id: request_id.clone(),
            stream_id,
            camera_id,
        };
        self.send_request(instance_id, msg).await?;
        debug!("query_analysis_status sent to '{}'", instance_id);
        Ok(request_id)
    }

    /// Send `terminate_app` on one connection and wait for the
    /// acknowledgment.
    ///
    /// Returns `Ok(false)` on timeout or when the instance answers with
    /// anything but `OK`.
    pub async fn request_terminate(
        &self,
        connection_id: &str,
        timeout: Duration,
    ) -> Result<bool, SendError> {
        let instance_id = self
            .registry
            .instance_of(connection_id)
            .ok_or_else(|| SendError::ChannelClosed(connection_id.to_string()))?;
        let request_id = new_request_id();
        let msg = OutboundMessage::TerminateApp {
            request_id: request_id.clone(),
        };
        let rx = self.tracker.register(&request_id, &instance_id, msg.kind());
        if let Err(e) = self.registry.send(connection_id, &msg).await {
            self.tracker.abandon(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(InboundMessage::AppTerminated(reply))) => Ok(reply.acknowledged()),
            Ok(Ok(other)) => {
                warn!("Unexpected {:?} answering terminate", other.kind());
                Ok(false)
            }
            Ok(Err(_)) => Ok(false),
            Err(_) => {
                self.tracker.abandon(&request_id);
                warn!(
                    "'{}' did not acknowledge terminate within {:?}",
                    instance_id, timeout
                );
                Ok(false)
            }
        }
    }

    /// Submit a camera job on a slot.
    ///
    /// Files are attached to the camera in every accepted case; they are
    /// pushed right away only when the camera starts running.
    pub async fn submit_camera(
        &self,
        instance_id: &str,
        stream_id: StreamId,
        camera: CameraRequest,
        files: &[FileDescriptor],
    ) -> Result<StartOutcome, SendError> {
        let camera_id = camera.camera_id;
        let already_active = self
            .allocator
            .camera(instance_id, camera_id)
            .map_or(false, |c| !c.status.is_finished());
        if already_active {
            return Ok(StartOutcome::Rejected);
        }

        let started = self
            .allocator
            .start_analysis(instance_id, stream_id, camera.clone());
        let queued = !started && self.allocator.camera(instance_id, camera_id).is_some();
        if !started && !queued {
            return Ok(StartOutcome::Rejected);
        }

        self.allocator.add_files(instance_id, camera_id, files);
        if queued {
            return Ok(StartOutcome::Queued);
        }

        let request_id = match self.start_analysis(instance_id, stream_id, &camera).await {
            Ok(id) => id,
            Err(e) => {
                // The instance never got the job; free the slot again.
                self.allocator.interrupt_analysis(instance_id, camera_id);
                return Err(e);
            }
        };
        if !files.is_empty() {
            self.push_files(instance_id, stream_id, camera_id, files)
                .await?;
        }
        Ok(StartOutcome::Started { request_id })
    }
}

fn new_request_id() -> String {
    Uuid::new_v4().to_string()
}
