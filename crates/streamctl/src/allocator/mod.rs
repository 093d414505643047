// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Stream slot allocator.
//!
//! Pure state machine over instances, their stream slots, the camera jobs
//! bound to those slots and the file tasks of each camera. No I/O happens
//! here; the protocol engine and HTTP handlers drive it.
//!
//! Each instance sits behind its own lock, so mutations of different
//! instances never contend and every operation on one instance is atomic.
//!
//! # Slot rules
//!
//! - A slot runs at most one camera. Starting a camera on a busy slot
//!   queues it (FIFO, no duplicates) and returns `false`.
//! - Completing the running camera promotes the next queued camera, if any,
//!   otherwise the slot becomes idle.
//! - Interrupting the running camera always leaves the slot idle, even when
//!   cameras are queued behind it.

pub mod model;
mod status;

use crate::protocol::{AnalysisStatus, CameraId, FileDescriptor, FileId, StreamId};
use chrono::Utc;
use dashmap::DashMap;
use model::{
    Camera, CameraRequest, CameraStatus, FileStatus, Instance, InstanceInfo, InstanceStatus,
    MetricsSnapshot, Stream, StreamStatus, TransportStatus,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of completing a camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionOutcome {
    /// Slot the camera was bound to
    pub stream_id: StreamId,
    /// Camera taken from the slot queue and now running on it
    pub promoted: Option<CameraId>,
}

/// Owner of all instance, stream, camera and file state.
#[derive(Default)]
pub struct Allocator {
    instances: DashMap<String, Arc<Mutex<Instance>>>,
}

impl Allocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` with exclusive access to one instance.
    ///
    /// The map guard is dropped before the instance lock is taken.
    fn with_instance<R>(
        &self,
        instance_id: &str,
        f: impl FnOnce(&mut Instance) -> R,
    ) -> Option<R> {
        let slot = self.instances.get(instance_id)?.value().clone();
        let mut instance = slot.lock();
        Some(f(&mut instance))
    }

    // ---------------------------------------------------------------------
    // Instances
    // ---------------------------------------------------------------------

    /// Register an instance with `streams_count` idle slots.
    ///
    /// Returns `false` if the instance already exists; its state is kept.
    pub fn register_instance(
        &self,
        instance_id: &str,
        config_path: &str,
        streams_count: usize,
    ) -> bool {
        let mut created = false;
        self.instances
            .entry(instance_id.to_string())
            .or_insert_with(|| {
                created = true;
                Arc::new(Mutex::new(Instance::new(instance_id, config_path, streams_count)))
            });

        if created {
            info!(
                "Registered instance '{}' ({} streams, config {})",
                instance_id, streams_count, config_path
            );
        }
        created
    }

    /// Register an instance unless it exists, then return its summary.
    pub fn ensure_instance(
        &self,
        instance_id: &str,
        config_path: &str,
        streams_count: usize,
    ) -> Option<InstanceInfo> {
        self.register_instance(instance_id, config_path, streams_count);
        self.instance_info(instance_id)
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.instances.contains_key(instance_id)
    }

    /// Update lifecycle and/or transport status. Touches `last_seen`.
    pub fn update_instance_status(
        &self,
        instance_id: &str,
        status: Option<InstanceStatus>,
        ws_status: Option<TransportStatus>,
    ) -> bool {
        self.with_instance(instance_id, |instance| {
            if let Some(status) = status {
                instance.status = status;
            }
            if let Some(ws_status) = ws_status {
                instance.ws_status = ws_status;
            }
            instance.last_seen = Some(Utc::now());
        })
        .is_some()
    }

    pub fn instance_info(&self, instance_id: &str) -> Option<InstanceInfo> {
        self.with_instance(instance_id, |instance| instance.info())
    }

    /// Full copy of an instance's state.
    pub fn instance(&self, instance_id: &str) -> Option<Instance> {
        self.with_instance(instance_id, |instance| instance.clone())
    }

    /// All instances, ordered by id.
    pub fn instances(&self) -> Vec<InstanceInfo> {
        let mut infos: Vec<InstanceInfo> = self
            .instance_ids()
            .iter()
            .filter_map(|id| self.instance_info(id))
            .collect();
        infos.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        infos
    }

    pub fn instance_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn update_metrics(&self, instance_id: &str, metrics: MetricsSnapshot) -> bool {
        self.with_instance(instance_id, |instance| {
            instance.metrics = Some(metrics);
        })
        .is_some()
    }

    pub fn metrics(&self, instance_id: &str) -> Option<MetricsSnapshot> {
        self.with_instance(instance_id, |instance| instance.metrics.clone())
            .flatten()
    }

    // ---------------------------------------------------------------------
    // Stream slots
    // ---------------------------------------------------------------------

    /// Lowest-numbered idle slot of an instance.
    pub fn available_stream(&self, instance_id: &str) -> Option<StreamId> {
        self.with_instance(instance_id, |instance| {
            instance
                .streams
                .values()
                .find(|s| s.is_idle())
                .map(|s| s.stream_id)
        })
        .flatten()
    }

    /// First connected instance (by id) with an idle slot.
    pub fn find_available_slot(&self) -> Option<(String, StreamId)> {
        self.instance_ids().into_iter().find_map(|id| {
            let connected = self
                .with_instance(&id, |i| i.ws_status == TransportStatus::Connected)
                .unwrap_or(false);
            if !connected {
                return None;
            }
            self.available_stream(&id).map(|stream_id| (id, stream_id))
        })
    }

    pub fn stream(&self, instance_id: &str, stream_id: StreamId) -> Option<Stream> {
        self.with_instance(instance_id, |instance| instance.streams.get(&stream_id).cloned())
            .flatten()
    }

    pub fn camera(&self, instance_id: &str, camera_id: CameraId) -> Option<Camera> {
        self.with_instance(instance_id, |instance| instance.cameras.get(&camera_id).cloned())
            .flatten()
    }

    /// Start a camera on a slot.
    ///
    /// Returns `true` if the camera now runs on the slot. Returns `false`
    /// if the slot is busy, in which case the camera is queued behind it
    /// (deferred, not failed), or if the instance or slot does not exist.
    pub fn start_analysis(
        &self,
        instance_id: &str,
        stream_id: StreamId,
        request: CameraRequest,
    ) -> bool {
        self.with_instance(instance_id, |instance| {
            let camera_id = request.camera_id;
            if let Some(existing) = instance.cameras.get(&camera_id) {
                if !existing.status.is_finished() {
                    debug!(
                        "camera_{} already {:?} on stream_{}",
                        camera_id, existing.status, existing.stream_id
                    );
                    return false;
                }
            }

            let Some(stream) = instance.streams.get_mut(&stream_id) else {
                warn!("start_analysis: stream {} not found on '{}'", stream_id, instance_id);
                return false;
            };

            if !stream.is_idle() {
                stream.queue.push_back(camera_id);
                instance
                    .cameras
                    .insert(camera_id, Camera::new(stream_id, &request, CameraStatus::Queued));
                info!(
                    "Stream {} on '{}' busy, queued camera_{} (depth {})",
                    stream_id,
                    instance_id,
                    camera_id,
                    stream.queue.len()
                );
                return false;
            }

            stream.status = StreamStatus::Running;
            stream.current_camera_id = Some(request.camera_id);
            instance.cameras.insert(
                request.camera_id,
                Camera::new(stream_id, &request, CameraStatus::Running),
            );
            instance.status = InstanceStatus::Running;

            info!(
                "Analysis started: {}, stream_{}, camera_{}",
                instance_id, stream_id, request.camera_id
            );
            true
        })
        .unwrap_or(false)
    }

    /// Append file tasks to a camera. Fails if the camera is unknown.
    pub fn add_files(
        &self,
        instance_id: &str,
        camera_id: CameraId,
        files: &[FileDescriptor],
    ) -> bool {
        self.with_instance(instance_id, |instance| {
            let Some(camera) = instance.cameras.get_mut(&camera_id) else {
                return false;
            };
            camera.files.extend(files.iter().map(Into::into));
            info!("Added {} files to camera_{}", files.len(), camera_id);
            true
        })
        .unwrap_or(false)
    }

    /// Mark a file as being processed.
    pub fn start_file(&self, instance_id: &str, camera_id: CameraId, file_id: FileId) -> bool {
        self.with_instance(instance_id, |instance| {
            let Some(camera) = instance.cameras.get_mut(&camera_id) else {
                return false;
            };
            let Some(file) = camera.file_mut(file_id) else {
                return false;
            };
            file.status = FileStatus::Processing;
            file.started_at = Some(Utc::now());
            camera.current_file_id = Some(file_id);
            true
        })
        .unwrap_or(false)
    }

    /// Mark a file as completed. Unknown ids leave every file untouched.
    pub fn complete_file(&self, instance_id: &str, camera_id: CameraId, file_id: FileId) -> bool {
        self.with_instance(instance_id, |instance| {
            let Some(camera) = instance.cameras.get_mut(&camera_id) else {
                return false;
            };
            let Some(file) = camera.file_mut(file_id) else {
                return false;
            };
            file.status = FileStatus::Completed;
            file.completed_at = Some(Utc::now());
            file.progress_pct = 100.0;
            if camera.current_file_id == Some(file_id) {
                camera.current_file_id = None;
            }
            true
        })
        .unwrap_or(false)
    }

    /// Mark a camera as completed and free (or hand over) its slot.
    pub fn complete_camera(
        &self,
        instance_id: &str,
        camera_id: CameraId,
    ) -> Option<CompletionOutcome> {
        self.with_instance(instance_id, |instance| {
            let camera = instance.cameras.get_mut(&camera_id)?;
            let stream_id = camera.stream_id;
            camera.status = CameraStatus::Completed;
            camera.finished_at = Some(Utc::now());
            camera.current_file_id = None;

            let stream = instance.streams.get_mut(&stream_id)?;
            if stream.current_camera_id != Some(camera_id) {
                // Completed while still waiting: just leave the queue.
                stream.queue.retain(|id| *id != camera_id);
                info!("Camera analysis completed: camera_{} (was queued)", camera_id);
                return Some(CompletionOutcome {
                    stream_id,
                    promoted: None,
                });
            }

            stream.current_camera_id = None;
            let promoted = promote_next(stream, &mut instance.cameras);
            if promoted.is_none() {
                stream.status = StreamStatus::Idle;
            }
            refresh_instance_status(instance);

            info!("Camera analysis completed: camera_{}", camera_id);
            Some(CompletionOutcome { stream_id, promoted })
        })
        .flatten()
    }

    /// Interrupt a camera. The slot becomes idle regardless of its queue.
    pub fn interrupt_analysis(&self, instance_id: &str, camera_id: CameraId) -> bool {
        self.with_instance(instance_id, |instance| {
            let Some(camera) = instance.cameras.get_mut(&camera_id) else {
                return false;
            };
            let stream_id = camera.stream_id;
            camera.status = CameraStatus::Interrupted;
            camera.finished_at = Some(Utc::now());
            camera.current_file_id = None;
            for file in camera
                .files
                .iter_mut()
                .filter(|f| f.status == FileStatus::Processing)
            {
                file.status = FileStatus::Interrupted;
            }

            let Some(stream) = instance.streams.get_mut(&stream_id) else {
                return false;
            };
            if stream.current_camera_id == Some(camera_id) {
                stream.current_camera_id = None;
                stream.status = StreamStatus::Idle;
            } else {
                stream.queue.retain(|id| *id != camera_id);
            }
            refresh_instance_status(instance);

            info!("Analysis interrupted: camera_{}", camera_id);
            true
        })
        .unwrap_or(false)
    }

    // ---------------------------------------------------------------------
    // Views and retention
    // ---------------------------------------------------------------------

    /// Status of one camera, one stream, or every stream of an instance.
    ///
    /// A camera filter takes precedence over a stream filter.
    pub fn analysis_status(
        &self,
        instance_id: &str,
        stream_id: Option<StreamId>,
        camera_id: Option<CameraId>,
    ) -> Option<AnalysisStatus> {
        self.with_instance(instance_id, |instance| match (camera_id, stream_id) {
            (Some(camera_id), _) => status::camera_status(instance, camera_id),
            (None, Some(stream_id)) => status::stream_status(instance, stream_id),
            (None, None) => Some(status::all_streams_status(instance)),
        })
        .flatten()
    }

    /// Drop finished cameras older than `retention`.
    ///
    /// Cameras still referenced by a slot or a slot queue are kept.
    /// Returns the number of cameras removed.
    pub fn prune_finished(&self, retention: Duration) -> usize {
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return 0;
        };
        let cutoff = Utc::now() - retention;
        let mut removed = 0;

        for id in self.instance_ids() {
            removed += self
                .with_instance(&id, |instance| {
                    let referenced: Vec<CameraId> = instance
                        .streams
                        .values()
                        .flat_map(|s| {
                            s.current_camera_id
                                .into_iter()
                                .chain(s.queue.iter().copied())
                        })
                        .collect();
                    let before = instance.cameras.len();
                    instance.cameras.retain(|camera_id, camera| {
                        let expired = camera.status.is_finished()
                            && camera.finished_at.map_or(false, |t| t <= cutoff);
                        !expired || referenced.contains(camera_id)
                    });
                    before - instance.cameras.len()
                })
                .unwrap_or(0);
        }

        if removed > 0 {
            debug!("Pruned {} finished cameras", removed);
        }
        removed
    }
}

/// Bind the next queued camera to a freed slot.
///
/// Queue entries without a waiting camera record (already finished or
/// pruned) are skipped.
fn promote_next(
    stream: &mut Stream,
    cameras: &mut std::collections::HashMap<CameraId, Camera>,
) -> Option<CameraId> {
    while let Some(next) = stream.queue.pop_front() {
        match cameras.get_mut(&next) {
            Some(camera) if camera.status == CameraStatus::Queued => {
                camera.status = CameraStatus::Running;
                camera.started_at = Some(Utc::now());
                stream.current_camera_id = Some(next);
                stream.status = StreamStatus::Running;
                info!(
                    "Promoted queued camera_{} on stream_{}",
                    next, stream.stream_id
                );
                return Some(next);
            }
            _ => {
                warn!("Dropping stale queue entry camera_{}", next);
            }
        }
    }
    None
}

/// Running while at least one slot is busy, idle once all are free.
fn refresh_instance_status(instance: &mut Instance) {
    if !matches!(instance.status, InstanceStatus::Idle | InstanceStatus::Running) {
        return;
    }
    instance.status = if instance.streams.values().any(|s| !s.is_idle()) {
        InstanceStatus::Running
    } else {
        InstanceStatus::Idle
    };
}
