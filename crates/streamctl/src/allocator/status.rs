// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Status views built from allocator state.

use super::model::{Camera, FileStatus, Instance, Stream};
use crate::protocol::{
    AnalysisStatus, CameraId, CameraStatusView, FilesStatus, ProcessingFile, QueuedFile,
    StreamId, StreamStatusView,
};

fn files_status(camera: &Camera) -> FilesStatus {
    let mut status = FilesStatus::default();
    for file in &camera.files {
        match file.status {
            FileStatus::Processing => status.processing.push(ProcessingFile {
                file_id: file.file_id,
                file_name: file.file_name.clone(),
                progress_pct: file.progress_pct,
            }),
            FileStatus::Completed => status.completed_count += 1,
            FileStatus::Pending => status.queued.push(QueuedFile {
                file_id: file.file_id,
                file_name: file.file_name.clone(),
            }),
            FileStatus::Interrupted | FileStatus::Error => {}
        }
    }
    status.queued_count = status.queued.len();
    status
}

fn camera_view(camera: &Camera) -> CameraStatusView {
    CameraStatusView {
        camera_id: camera.camera_id,
        status: camera.status,
        files: files_status(camera),
    }
}

/// Current camera first, then the wait queue in FIFO order.
fn stream_view(instance: &Instance, stream: &Stream) -> StreamStatusView {
    let cameras = stream
        .current_camera_id
        .iter()
        .chain(stream.queue.iter())
        .filter_map(|id| instance.cameras.get(id))
        .map(camera_view)
        .collect();

    StreamStatusView {
        stream_id: stream.stream_id,
        status: stream.status,
        cameras,
    }
}

pub(super) fn camera_status(instance: &Instance, camera_id: CameraId) -> Option<AnalysisStatus> {
    let camera = instance.cameras.get(&camera_id)?;
    Some(AnalysisStatus::Camera {
        stream_id: camera.stream_id,
        camera: camera_view(camera),
    })
}

pub(super) fn stream_status(instance: &Instance, stream_id: StreamId) -> Option<AnalysisStatus> {
    let stream = instance.streams.get(&stream_id)?;
    Some(AnalysisStatus::Stream {
        stream: stream_view(instance, stream),
    })
}

pub(super) fn all_streams_status(instance: &Instance) -> AnalysisStatus {
    AnalysisStatus::All {
        streams: instance
            .streams
            .values()
            .map(|s| stream_view(instance, s))
            .collect(),
    }
}
