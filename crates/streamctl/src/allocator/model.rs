// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Instance, stream, camera and file records owned by the allocator.

use crate::protocol::{AnalysisKind, CameraId, FileDescriptor, FileId, StreamId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Lifecycle of an analytics instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Idle,
    Running,
    Error,
    Disconnected,
}

/// State of the WebSocket session of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportStatus {
    Connected,
    Disconnected,
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Idle,
    Running,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraStatus {
    Queued,
    Running,
    Completed,
    Interrupted,
    Error,
}

impl CameraStatus {
    /// Completed, interrupted and errored cameras never run again.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Interrupted | Self::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Processing,
    Completed,
    Interrupted,
    Error,
}

/// One input file of a camera job.
#[derive(Debug, Clone, Serialize)]
pub struct FileTask {
    pub file_id: FileId,
    pub file_path: String,
    pub file_name: String,
    pub output_path: String,
    pub status: FileStatus,
    pub progress_pct: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&FileDescriptor> for FileTask {
    fn from(f: &FileDescriptor) -> Self {
        Self {
            file_id: f.file_id,
            file_path: f.file_path.clone(),
            file_name: f.file_name.clone(),
            output_path: f.output_path.clone(),
            status: FileStatus::Pending,
            progress_pct: 0.0,
            started_at: None,
            completed_at: None,
        }
    }
}

impl FileTask {
    pub fn descriptor(&self) -> FileDescriptor {
        FileDescriptor {
            file_id: self.file_id,
            file_path: self.file_path.clone(),
            file_name: self.file_name.clone(),
            output_path: self.output_path.clone(),
        }
    }
}

/// Parameters of a camera job as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraRequest {
    pub camera_id: CameraId,
    pub camera_type: AnalysisKind,
    pub path: String,
    pub name: String,
    pub output_dir: String,
}

/// One analysis job bound to (or waiting for) a stream slot.
#[derive(Debug, Clone, Serialize)]
pub struct Camera {
    pub camera_id: CameraId,
    pub stream_id: StreamId,
    pub kind: AnalysisKind,
    pub path: String,
    pub name: String,
    pub output_dir: String,
    pub status: CameraStatus,
    pub files: Vec<FileTask>,
    pub current_file_id: Option<FileId>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Camera {
    pub fn new(stream_id: StreamId, request: &CameraRequest, status: CameraStatus) -> Self {
        Self {
            camera_id: request.camera_id,
            stream_id,
            kind: request.camera_type,
            path: request.path.clone(),
            name: request.name.clone(),
            output_dir: request.output_dir.clone(),
            status,
            files: Vec::new(),
            current_file_id: None,
            started_at: (status == CameraStatus::Running).then(Utc::now),
            finished_at: None,
        }
    }

    pub fn request(&self) -> CameraRequest {
        CameraRequest {
            camera_id: self.camera_id,
            camera_type: self.kind,
            path: self.path.clone(),
            name: self.name.clone(),
            output_dir: self.output_dir.clone(),
        }
    }

    pub(crate) fn file_mut(&mut self, file_id: FileId) -> Option<&mut FileTask> {
        self.files.iter_mut().find(|f| f.file_id == file_id)
    }
}

/// One of the N concurrent processing channels of an instance.
#[derive(Debug, Clone, Serialize)]
pub struct Stream {
    pub stream_id: StreamId,
    pub status: StreamStatus,
    pub current_camera_id: Option<CameraId>,
    /// Cameras waiting for this slot, oldest first
    pub queue: VecDeque<CameraId>,
}

impl Stream {
    pub fn new(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            status: StreamStatus::Idle,
            current_camera_id: None,
            queue: VecDeque::new(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == StreamStatus::Idle
    }
}

/// Last resource usage reported by an instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub cpu_percent: f64,
    pub ram_mb: f64,
    pub gpu_percent: f64,
    pub vram_mb: f64,
    pub recorded_at: DateTime<Utc>,
}

/// A remote analytics worker and all of its job state.
#[derive(Debug, Clone, Serialize)]
pub struct Instance {
    pub instance_id: String,
    pub config_path: String,
    pub streams_count: usize,
    pub status: InstanceStatus,
    pub ws_status: TransportStatus,
    pub streams: BTreeMap<StreamId, Stream>,
    pub cameras: HashMap<CameraId, Camera>,
    pub metrics: Option<MetricsSnapshot>,
    pub registered_at: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Instance {
    pub fn new(
        instance_id: impl Into<String>,
        config_path: impl Into<String>,
        streams_count: usize,
    ) -> Self {
        let streams = (0..streams_count as StreamId)
            .map(|id| (id, Stream::new(id)))
            .collect();

        Self {
            instance_id: instance_id.into(),
            config_path: config_path.into(),
            streams_count,
            status: InstanceStatus::Idle,
            ws_status: TransportStatus::Disconnected,
            streams,
            cameras: HashMap::new(),
            metrics: None,
            registered_at: Utc::now(),
            last_seen: None,
        }
    }

    pub fn info(&self) -> InstanceInfo {
        InstanceInfo {
            instance_id: self.instance_id.clone(),
            config_path: self.config_path.clone(),
            streams_count: self.streams_count,
            status: self.status,
            ws_status: self.ws_status,
            registered_at: self.registered_at,
            last_seen: self.last_seen,
            busy_streams: self.streams.values().filter(|s| !s.is_idle()).count(),
            cameras: self.cameras.len(),
        }
    }
}

/// Summary of an instance for listings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub config_path: String,
    pub streams_count: usize,
    pub status: InstanceStatus,
    pub ws_status: TransportStatus,
    pub registered_at: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
    pub busy_streams: usize,
    pub cameras: usize,
}
