// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Integration tests for the instance WebSocket session.
//!
//! Each test starts a real server on an ephemeral port and plays the part
//! of one or more analytics instances.

mod common;

use common::*;
use serde_json::json;
use streamctl::allocator::model::{
    CameraRequest, CameraStatus, FileStatus, InstanceStatus, StreamStatus, TransportStatus,
};
use streamctl::launcher::{LaunchStatus, ProcessLauncher};
use streamctl::protocol::{AnalysisKind, FileDescriptor};
use streamctl::StartOutcome;

fn camera(camera_id: u64) -> CameraRequest {
    CameraRequest {
        camera_id,
        camera_type: AnalysisKind::Fileset,
        path: format!("/data/cam{}", camera_id),
        name: format!("Camera {}", camera_id),
        output_dir: "/out".into(),
    }
}

fn file(file_id: u64) -> FileDescriptor {
    FileDescriptor {
        file_id,
        file_path: format!("/data/f{}.mp4", file_id),
        file_name: format!("f{}.mp4", file_id),
        output_path: format!("/out/f{}", file_id),
    }
}

#[tokio::test]
async fn test_handshake_is_verified() {
    let server = start_server(&[("node-1", 2)]).await;
    let mut ws = connect(&server).await;

    let ack = handshake(&mut ws, "node-1", 2).await;
    assert_eq!(ack["request_id"], "ready-node-1");
    assert_eq!(ack["status"], "ok");
    assert_eq!(ack["config_verified"], true);
    assert_eq!(ack["streams_count_verified"], true);
    assert!(ack.get("error_code").is_none());

    let state = server.server.state();
    let info = state.allocator.instance_info("node-1").unwrap();
    assert_eq!(info.status, InstanceStatus::Idle);
    assert_eq!(info.ws_status, TransportStatus::Connected);
    assert_eq!(server.launcher.lookup("node-1").unwrap().container_pid, Some(4242));
    assert_eq!(state.registry.connected_instances(), vec!["node-1".to_string()]);
}

#[tokio::test]
async fn test_handshake_streams_mismatch_keeps_connection() {
    let server = start_server(&[("node-1", 4)]).await;
    let mut ws = connect(&server).await;

    let ack = handshake(&mut ws, "node-1", 2).await;
    assert_eq!(ack["status"], "error");
    assert_eq!(ack["error_code"], "STREAMS_COUNT_MISMATCH");
    assert_eq!(ack["config_verified"], true);
    assert_eq!(ack["streams_count_verified"], false);

    // Still bound: the instance can be queried.
    let request_id = server
        .server
        .state()
        .engine
        .query_metrics("node-1")
        .await
        .unwrap();
    let query = recv_json(&mut ws).await;
    assert_eq!(query["type"], "query_metrics");
    assert_eq!(query["request_id"], request_id.as_str());
}

#[tokio::test]
async fn test_messages_before_handshake_are_dropped() {
    let server = start_server(&[("node-1", 1)]).await;
    let mut ws = connect(&server).await;

    send_json(
        &mut ws,
        json!({
            "type": "file_done",
            "request_id": "x",
            "stream_id": 0,
            "camera_id": 1,
            "file_id": 1,
            "processed_file": "f1.mp4"
        }),
    )
    .await;
    send_json(&mut ws, json!({"type": "no_such_message"})).await;
    send_json(&mut ws, json!({"not": "json with a type"})).await;

    // The session survives all three and still answers the handshake.
    let ack = handshake(&mut ws, "node-1", 1).await;
    assert_eq!(ack["status"], "ok");
}

#[tokio::test]
async fn test_camera_job_lifecycle() {
    let server = start_server(&[("node-1", 2)]).await;
    let state = server.server.state();
    let mut ws = connect(&server).await;
    handshake(&mut ws, "node-1", 2).await;

    let outcome = state
        .engine
        .submit_camera("node-1", 0, camera(7), &[file(1), file(2)])
        .await
        .unwrap();
    assert!(matches!(outcome, StartOutcome::Started { .. }));

    let start = recv_json(&mut ws).await;
    assert_eq!(start["type"], "start_analysis");
    assert_eq!(start["camera_id"], 7);
    assert_eq!(start["camera_type"], "fileset");

    let push = recv_json(&mut ws).await;
    assert_eq!(push["type"], "push_file");
    assert_eq!(push["files_count"], 2);
    let items = push["files"].as_array().unwrap();
    assert_eq!(items.len(), 3);
    assert_eq!(items[2]["file_type"], "eos");

    for (kind, extra) in [
        ("analysis_started", json!({"status": "ok"})),
        ("push_ack", json!({"status": "ok"})),
        ("processing_started", json!({"file_id": 1, "current_file": "f1.mp4"})),
        ("file_done", json!({"file_id": 1, "processed_file": "f1.mp4"})),
    ] {
        let mut msg = json!({
            "type": kind,
            "request_id": start["request_id"],
            "stream_id": 0,
            "camera_id": 7
        });
        for (k, v) in extra.as_object().unwrap() {
            msg[k] = v.clone();
        }
        send_json(&mut ws, msg).await;
    }

    assert!(
        eventually(|| {
            state
                .allocator
                .camera("node-1", 7)
                .map_or(false, |c| c.files[0].status == FileStatus::Completed)
        })
        .await
    );
    assert_eq!(
        state.allocator.instance_info("node-1").unwrap().status,
        InstanceStatus::Running
    );

    send_json(
        &mut ws,
        json!({
            "type": "analysis_complete",
            "request_id": start["request_id"],
            "stream_id": 0,
            "camera_id": 7,
            "status": "ok",
            "processed_count": 2,
            "message": "done"
        }),
    )
    .await;

    assert!(
        eventually(|| {
            state
                .allocator
                .camera("node-1", 7)
                .map_or(false, |c| c.status == CameraStatus::Completed)
        })
        .await
    );
    let stream = state.allocator.stream("node-1", 0).unwrap();
    assert_eq!(stream.status, StreamStatus::Idle);
    assert_eq!(stream.current_camera_id, None);
    assert_eq!(
        state.allocator.instance_info("node-1").unwrap().status,
        InstanceStatus::Idle
    );
}

#[tokio::test]
async fn test_queued_camera_starts_after_completion() {
    let server = start_server(&[("node-1", 1)]).await;
    let state = server.server.state();
    let mut ws = connect(&server).await;
    handshake(&mut ws, "node-1", 1).await;

    state
        .engine
        .submit_camera("node-1", 0, camera(1), &[])
        .await
        .unwrap();
    let first = recv_json(&mut ws).await;
    assert_eq!(first["camera_id"], 1);

    let queued = state
        .engine
        .submit_camera("node-1", 0, camera(2), &[file(9)])
        .await
        .unwrap();
    assert_eq!(queued, StartOutcome::Queued);

    send_json(
        &mut ws,
        json!({
            "type": "analysis_complete",
            "request_id": first["request_id"],
            "stream_id": 0,
            "camera_id": 1,
            "status": "ok",
            "processed_count": 0,
            "message": "done"
        }),
    )
    .await;

    let promoted = recv_json(&mut ws).await;
    assert_eq!(promoted["type"], "start_analysis");
    assert_eq!(promoted["camera_id"], 2);
    let push = recv_json(&mut ws).await;
    assert_eq!(push["type"], "push_file");
    assert_eq!(push["files"][0]["file_id"], 9);

    let stream = state.allocator.stream("node-1", 0).unwrap();
    assert_eq!(stream.current_camera_id, Some(2));
    assert!(stream.queue.is_empty());
}

#[tokio::test]
async fn test_disconnect_marks_instance_disconnected() {
    let server = start_server(&[("node-1", 1)]).await;
    let state = server.server.state();
    let mut ws = connect(&server).await;
    handshake(&mut ws, "node-1", 1).await;

    ws.close(None).await.unwrap();
    drop(ws);

    assert!(eventually(|| state.registry.is_empty()).await);
    let info = state.allocator.instance_info("node-1").unwrap();
    assert_eq!(info.ws_status, TransportStatus::Disconnected);
    assert_eq!(state.registry.history().len(), 1);
}

#[tokio::test]
async fn test_reconnect_after_going_away_restores_session() {
    let server = start_server(&[("node-1", 2)]).await;
    let state = server.server.state();

    let mut ws = connect(&server).await;
    handshake(&mut ws, "node-1", 2).await;
    ws.close(None).await.unwrap();
    drop(ws);
    assert!(eventually(|| state.registry.is_empty()).await);

    let mut ws = connect(&server).await;
    let mut ready = app_ready("node-1", 2);
    ready["reconnect"] = json!(true);
    ready["last_close_code"] = json!(1001);
    send_json(&mut ws, ready).await;

    let ack = recv_json(&mut ws).await;
    assert_eq!(ack["type"], "execute_ack");
    assert_eq!(ack["reconnected"], true);
    assert_eq!(ack["session_restored"], true);

    let info = state.allocator.instance_info("node-1").unwrap();
    assert_eq!(info.status, InstanceStatus::Idle);
    assert_eq!(info.ws_status, TransportStatus::Connected);
    assert_eq!(state.reconnect.stats("node-1").unwrap().reconnect_count, 1);
}

#[tokio::test]
async fn test_drain_terminates_instances() {
    let server = start_server(&[("node-1", 1), ("node-2", 1)]).await;
    let state = server.server.state();

    let mut polite = connect(&server).await;
    handshake(&mut polite, "node-1", 1).await;
    let mut silent = connect(&server).await;
    handshake(&mut silent, "node-2", 1).await;
    let mut anonymous = connect(&server).await;

    let polite_task = tokio::spawn(async move {
        let terminate = recv_json(&mut polite).await;
        assert_eq!(terminate["type"], "terminate_app");
        send_json(
            &mut polite,
            json!({
                "type": "app_terminated",
                "request_id": terminate["request_id"],
                "status": "OK",
                "message": "bye"
            }),
        )
        .await;
        recv_close(&mut polite).await
    });
    let silent_task = tokio::spawn(async move {
        let terminate = recv_json(&mut silent).await;
        assert_eq!(terminate["type"], "terminate_app");
        recv_close(&mut silent).await
    });

    let report = server.server.drain().await.unwrap();
    assert_eq!(report.acknowledged, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.unauthenticated_closed, 1);

    assert_eq!(polite_task.await.unwrap(), Some(1000));
    assert_eq!(silent_task.await.unwrap(), Some(1001));
    assert_eq!(recv_close(&mut anonymous).await, Some(1001));

    assert!(state.registry.is_empty());
    assert!(!state.registry.is_shutting_down());
    assert_eq!(
        server.launcher.lookup("node-1").unwrap().status,
        LaunchStatus::Stopped
    );
}

#[tokio::test]
async fn test_connection_refused_while_draining() {
    let server = start_server(&[("node-1", 1)]).await;

    // An instance that never acknowledges keeps the drain busy.
    let mut ws = connect(&server).await;
    handshake(&mut ws, "node-1", 1).await;

    let drain = {
        let server = server.server.clone();
        tokio::spawn(async move { server.drain().await })
    };
    let terminate = recv_json(&mut ws).await;
    assert_eq!(terminate["type"], "terminate_app");

    let mut late = connect(&server).await;
    assert_eq!(recv_close(&mut late).await, Some(1013));

    drain.await.unwrap().unwrap();
}
