// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire protocol between the control plane and analytics instances.
//!
//! One JSON object per WebSocket text frame. Every object carries a `type`
//! discriminator and a `request_id`:
//!
//! ```json
//! // Instance announces itself
//! {"type": "app_ready", "request_id": "r1", "instance_id": "cam-node-1",
//!  "config_path": "/cfg/ds.txt", "process_id": 4242, "streams_count": 4, "status": "ok"}
//!
//! // Control plane answers
//! {"type": "execute_ack", "request_id": "r1", "instance_id": "cam-node-1",
//!  "config_verified": true, "streams_count_verified": true, "status": "ok", ...}
//! ```

use crate::allocator::model::{CameraStatus, StreamStatus};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type StreamId = u32;
pub type CameraId = u64;
pub type FileId = u64;

/// WebSocket close codes that carry protocol meaning.
pub mod close_code {
    /// Peer-initiated graceful close, after `app_terminated`.
    pub const NORMAL: u16 = 1000;
    /// Control-plane initiated close.
    pub const GOING_AWAY: u16 = 1001;
    /// New connection refused during shutdown; the peer should reconnect.
    pub const TRY_AGAIN_LATER: u16 = 1013;
}

/// Every message type on the wire, in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    AppReady,
    ExecuteAck,
    StartAnalysis,
    AnalysisStarted,
    PushFile,
    PushAck,
    ProcessingStarted,
    FileDone,
    AnalysisComplete,
    InterruptAnalysis,
    AnalysisInterrupted,
    TerminateApp,
    AppTerminated,
    QueryMetrics,
    MetricsResponse,
    QueryAnalysisStatus,
    AnalysisStatus,
}

impl MessageKind {
    /// True for messages an instance sends to the control plane.
    pub fn is_inbound(self) -> bool {
        matches!(
            self,
            Self::AppReady
                | Self::AnalysisStarted
                | Self::PushAck
                | Self::ProcessingStarted
                | Self::FileDone
                | Self::AnalysisComplete
                | Self::AnalysisInterrupted
                | Self::AppTerminated
                | Self::MetricsResponse
                | Self::AnalysisStatus
        )
    }

    /// The inbound kind that answers an outbound request kind.
    pub fn reply_kind(self) -> Option<Self> {
        match self {
            Self::StartAnalysis => Some(Self::AnalysisStarted),
            Self::PushFile => Some(Self::PushAck),
            Self::InterruptAnalysis => Some(Self::AnalysisInterrupted),
            Self::TerminateApp => Some(Self::AppTerminated),
            Self::QueryMetrics => Some(Self::MetricsResponse),
            Self::QueryAnalysisStatus => Some(Self::AnalysisStatus),
            _ => None,
        }
    }
}

/// Generic status field carried by acknowledgments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Ok,
    Error,
    Running,
    Idle,
    Queued,
    Done,
}

impl ReplyStatus {
    pub fn is_ok(self) -> bool {
        self == Self::Ok
    }
}

/// Kind of analysis requested for a camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisKind {
    /// Continuous live stream
    Videostream,
    /// A set of files pushed in batches
    Fileset,
    /// A single file
    File,
}

impl AnalysisKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Videostream => "videostream",
            Self::Fileset => "fileset",
            Self::File => "file",
        }
    }
}

/// Machine-readable handshake failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandshakeErrorCode {
    /// Instance identity could not be verified
    ConfigMismatch,
    /// Reported stream capacity differs from the launch record
    StreamsCountMismatch,
}

/// One input file of a camera job, as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub file_id: FileId,
    pub file_path: String,
    pub file_name: String,
    pub output_path: String,
}

// ---------------------------------------------------------------------------
// Instance -> control plane
// ---------------------------------------------------------------------------

/// Messages received from an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    AppReady(AppReady),
    AnalysisStarted(AnalysisStarted),
    PushAck(PushAck),
    ProcessingStarted(ProcessingStarted),
    FileDone(FileDone),
    AnalysisComplete(AnalysisComplete),
    AnalysisInterrupted(AnalysisInterrupted),
    AppTerminated(AppTerminated),
    MetricsResponse(MetricsResponse),
    AnalysisStatus(AnalysisStatusReport),
}

impl InboundMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::AppReady(_) => MessageKind::AppReady,
            Self::AnalysisStarted(_) => MessageKind::AnalysisStarted,
            Self::PushAck(_) => MessageKind::PushAck,
            Self::ProcessingStarted(_) => MessageKind::ProcessingStarted,
            Self::FileDone(_) => MessageKind::FileDone,
            Self::AnalysisComplete(_) => MessageKind::AnalysisComplete,
            Self::AnalysisInterrupted(_) => MessageKind::AnalysisInterrupted,
            Self::AppTerminated(_) => MessageKind::AppTerminated,
            Self::MetricsResponse(_) => MessageKind::MetricsResponse,
            Self::AnalysisStatus(_) => MessageKind::AnalysisStatus,
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            Self::AppReady(m) => &m.request_id,
            Self::AnalysisStarted(m) => &m.request_id,
            Self::PushAck(m) => &m.request_id,
            Self::ProcessingStarted(m) => &m.request_id,
            Self::FileDone(m) => &m.request_id,
            Self::AnalysisComplete(m) => &m.request_id,
            Self::AnalysisInterrupted(m) => &m.request_id,
            Self::AppTerminated(m) => &m.request_id,
            Self::MetricsResponse(m) => &m.request_id,
            Self::AnalysisStatus(m) => &m.request_id,
        }
    }
}

/// Handshake sent by an instance once it is up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppReady {
    pub request_id: String,
    pub instance_id: String,
    pub config_path: String,
    /// PID of the worker process inside its container
    pub process_id: u32,
    pub streams_count: u32,
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    /// Set by instances resuming after a dropped session
    #[serde(default)]
    pub reconnect: bool,
    /// Close code of the previous session, if this is a reconnection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_close_code: Option<u16>,
}

impl AppReady {
    pub fn is_reconnection(&self) -> bool {
        self.reconnect || self.last_close_code.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisStarted {
    pub request_id: String,
    pub stream_id: StreamId,
    pub camera_id: CameraId,
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushAck {
    pub request_id: String,
    pub stream_id: StreamId,
    pub camera_id: CameraId,
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingStarted {
    pub request_id: String,
    pub stream_id: StreamId,
    pub camera_id: CameraId,
    pub file_id: FileId,
    pub current_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDone {
    pub request_id: String,
    pub stream_id: StreamId,
    pub camera_id: CameraId,
    pub file_id: FileId,
    pub processed_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisComplete {
    pub request_id: String,
    pub stream_id: StreamId,
    pub camera_id: CameraId,
    pub status: ReplyStatus,
    pub processed_count: u64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisInterrupted {
    pub request_id: String,
    pub stream_id: StreamId,
    pub camera_id: CameraId,
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
}

/// Answer to `terminate_app`; echoes the original request id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppTerminated {
    pub request_id: String,
    pub status: String,
    #[serde(default)]
    pub message: String,
}

impl AppTerminated {
    /// Only the exact string `OK` counts as an acknowledgment.
    pub fn acknowledged(&self) -> bool {
        self.status == "OK"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsResponse {
    pub request_id: String,
    pub cpu_percent: f64,
    pub ram_mb: f64,
    pub gpu_percent: f64,
    pub vram_mb: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Status tree reported by an instance for `query_analysis_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisStatusReport {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streams: Option<Vec<StreamStatusView>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamStatusView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_id: Option<StreamId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera: Option<CameraStatusView>,
}

// ---------------------------------------------------------------------------
// Control plane -> instance
// ---------------------------------------------------------------------------

/// Messages sent to an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    ExecuteAck(ExecuteAck),
    StartAnalysis(StartAnalysis),
    PushFile(PushFile),
    InterruptAnalysis(InterruptAnalysis),
    TerminateApp {
        request_id: String,
    },
    QueryMetrics {
        request_id: String,
    },
    QueryAnalysisStatus {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stream_id: Option<StreamId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        camera_id: Option<CameraId>,
    },
}

impl OutboundMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::ExecuteAck(_) => MessageKind::ExecuteAck,
            Self::StartAnalysis(_) => MessageKind::StartAnalysis,
            Self::PushFile(_) => MessageKind::PushFile,
            Self::InterruptAnalysis(_) => MessageKind::InterruptAnalysis,
            Self::TerminateApp { .. } => MessageKind::TerminateApp,
            Self::QueryMetrics { .. } => MessageKind::QueryMetrics,
            Self::QueryAnalysisStatus { .. } => MessageKind::QueryAnalysisStatus,
        }
    }

    pub fn request_id(&self) -> &str {
        match self {
            Self::ExecuteAck(m) => &m.request_id,
            Self::StartAnalysis(m) => &m.request_id,
            Self::PushFile(m) => &m.request_id,
            Self::InterruptAnalysis(m) => &m.request_id,
            Self::TerminateApp { request_id }
            | Self::QueryMetrics { request_id }
            | Self::QueryAnalysisStatus { request_id, .. } => request_id,
        }
    }
}

/// Handshake answer, also used for reconnection acknowledgments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteAck {
    pub request_id: String,
    pub instance_id: String,
    pub config_verified: bool,
    pub streams_count_verified: bool,
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<HandshakeErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reconnected: bool,
    /// Only present on reconnection acknowledgments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_restored: Option<bool>,
    pub timestamp: String,
}

impl ExecuteAck {
    /// Build an acknowledgment from the two verification flags.
    ///
    /// Identity failure takes precedence when both checks fail.
    pub fn verified(
        request_id: impl Into<String>,
        instance_id: impl Into<String>,
        config_verified: bool,
        streams_count_verified: bool,
    ) -> Self {
        let (status, error_code, error_message) = match (config_verified, streams_count_verified) {
            (true, true) => (ReplyStatus::Ok, None, None),
            (false, _) => (
                ReplyStatus::Error,
                Some(HandshakeErrorCode::ConfigMismatch),
                Some("Config verification failed".to_string()),
            ),
            (true, false) => (
                ReplyStatus::Error,
                Some(HandshakeErrorCode::StreamsCountMismatch),
                Some("Streams count verification failed".to_string()),
            ),
        };

        Self {
            request_id: request_id.into(),
            instance_id: instance_id.into(),
            config_verified,
            streams_count_verified,
            status,
            error_code,
            error_message,
            reconnected: false,
            session_restored: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Mark this acknowledgment as the answer to a reconnection.
    pub fn reconnection(mut self, session_restored: bool) -> Self {
        self.reconnected = true;
        self.session_restored = Some(session_restored);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartAnalysis {
    pub request_id: String,
    pub stream_id: StreamId,
    pub camera_id: CameraId,
    pub camera_type: AnalysisKind,
    pub path: String,
    pub name: String,
    pub output_dir: String,
}

/// One item of a `push_file` batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "file_type", rename_all = "lowercase")]
pub enum PushItem {
    File {
        file_id: FileId,
        file_path: String,
        file_name: String,
        output_path: String,
    },
    /// End-of-stream marker closing the batch
    Eos,
}

impl From<&FileDescriptor> for PushItem {
    fn from(f: &FileDescriptor) -> Self {
        Self::File {
            file_id: f.file_id,
            file_path: f.file_path.clone(),
            file_name: f.file_name.clone(),
            output_path: f.output_path.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushFile {
    pub request_id: String,
    pub stream_id: StreamId,
    pub camera_id: CameraId,
    /// Number of file items, the EOS marker excluded
    pub files_count: usize,
    pub files: Vec<PushItem>,
}

impl PushFile {
    /// Build a batch of `files.len()` file items followed by one EOS item.
    pub fn new(
        request_id: impl Into<String>,
        stream_id: StreamId,
        camera_id: CameraId,
        files: &[FileDescriptor],
    ) -> Self {
        let mut items: Vec<PushItem> = files.iter().map(PushItem::from).collect();
        items.push(PushItem::Eos);

        Self {
            request_id: request_id.into(),
            stream_id,
            camera_id,
            files_count: files.len(),
            files: items,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptAnalysis {
    pub request_id: String,
    pub stream_id: StreamId,
    pub camera_id: CameraId,
    #[serde(default = "default_interrupt_reason")]
    pub reason: String,
}

pub fn default_interrupt_reason() -> String {
    "user_cancelled".to_string()
}

// ---------------------------------------------------------------------------
// Status views (shared by the HTTP surface and `analysis_status` reports)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingFile {
    pub file_id: FileId,
    pub file_name: String,
    pub progress_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedFile {
    pub file_id: FileId,
    pub file_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilesStatus {
    #[serde(default)]
    pub processing: Vec<ProcessingFile>,
    #[serde(default)]
    pub completed_count: usize,
    #[serde(default)]
    pub queued_count: usize,
    #[serde(default)]
    pub queued: Vec<QueuedFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraStatusView {
    pub camera_id: CameraId,
    pub status: CameraStatus,
    pub files: FilesStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamStatusView {
    pub stream_id: StreamId,
    pub status: StreamStatus,
    #[serde(default)]
    pub cameras: Vec<CameraStatusView>,
}

/// Result of a status query, shaped by the filter that was applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AnalysisStatus {
    Camera {
        stream_id: StreamId,
        camera: CameraStatusView,
    },
    Stream {
        stream: StreamStatusView,
    },
    All {
        streams: Vec<StreamStatusView>,
    },
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Frame decoding failures. None of them close the connection.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Invalid JSON: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("Message has no type field")]
    MissingType,

    #[error("Unknown message type '{0}'")]
    UnknownType(String),

    #[error("Message type {0:?} is not accepted from instances")]
    UnexpectedDirection(MessageKind),

    #[error("Invalid {kind:?} message: {source}")]
    Invalid {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },
}

/// Decode one text frame received from an instance.
///
/// The envelope is checked first so that a bad frame can be reported with
/// the kind it claimed to be.
pub fn decode(text: &str) -> Result<InboundMessage, DecodeError> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(DecodeError::Malformed)?;

    let type_name = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(DecodeError::MissingType)?;

    let kind: MessageKind =
        serde_json::from_value(serde_json::Value::String(type_name.to_string()))
            .map_err(|_| DecodeError::UnknownType(type_name.to_string()))?;

    if !kind.is_inbound() {
        return Err(DecodeError::UnexpectedDirection(kind));
    }

    serde_json::from_value(value).map_err(|source| DecodeError::Invalid { kind, source })
}

/// Serialize a message for the wire.
pub fn encode(msg: &OutboundMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(msg)
}
