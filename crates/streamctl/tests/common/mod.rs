// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared helpers: a live server on an ephemeral port and a fake instance
//! client speaking the WebSocket protocol.

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use streamctl::{
    ControlConfig, ControlServer, InMemoryLauncher, LaunchRecord, ProcessLauncher, ShutdownConfig,
};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(3);

pub struct TestServer {
    pub server: ControlServer,
    pub launcher: Arc<InMemoryLauncher>,
    pub addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.stop();
        self.handle.abort();
    }
}

/// Drain timings short enough for tests.
pub fn fast_shutdown() -> ShutdownConfig {
    ShutdownConfig {
        ack_timeout_ms: 300,
        drain_deadline_ms: 1000,
        grace_period_ms: 50,
        force_close_timeout_ms: 200,
    }
}

/// Start a server on 127.0.0.1 with launch records for the given
/// `(instance_id, streams_count)` pairs.
pub async fn start_server(instances: &[(&str, u32)]) -> TestServer {
    start_server_with(instances, fast_shutdown()).await
}

pub async fn start_server_with(instances: &[(&str, u32)], shutdown: ShutdownConfig) -> TestServer {
    let launcher = Arc::new(InMemoryLauncher::new());
    for (instance_id, streams) in instances {
        launcher.record_launch(
            LaunchRecord::new(*instance_id, format!("/etc/{}.yaml", instance_id))
                .with_streams_count(*streams),
        );
    }

    let config = ControlConfig {
        bind_address: "127.0.0.1".into(),
        port: 0,
        shutdown,
        ..ControlConfig::default()
    };
    let server = ControlServer::with_launcher(config, launcher.clone()).unwrap();
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = {
        let server = server.clone();
        tokio::spawn(async move {
            server.serve(listener).await.unwrap();
        })
    };

    TestServer {
        server,
        launcher,
        addr,
        handle,
    }
}

pub async fn connect(server: &TestServer) -> Client {
    let (ws, _) = tokio_tungstenite::connect_async(server.ws_url())
        .await
        .unwrap();
    ws
}

pub async fn send_json(ws: &mut Client, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

/// Next text frame as JSON. Panics on close or timeout.
pub async fn recv_json(ws: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection ended")
            .unwrap();
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Close(frame) => panic!("unexpected close: {:?}", frame),
            _ => continue,
        }
    }
}

/// Wait for the close frame and return its code.
pub async fn recv_close(ws: &mut Client) -> Option<u16> {
    loop {
        let msg = tokio::time::timeout(RECV_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for close");
        match msg {
            Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return None,
        }
    }
}

pub fn app_ready(instance_id: &str, streams_count: u32) -> Value {
    json!({
        "type": "app_ready",
        "request_id": format!("ready-{}", instance_id),
        "instance_id": instance_id,
        "config_path": format!("/etc/{}.yaml", instance_id),
        "process_id": 4242,
        "streams_count": streams_count,
        "status": "ok",
        "version": "1.4.0"
    })
}

/// Send `app_ready` and return the `execute_ack`.
pub async fn handshake(ws: &mut Client, instance_id: &str, streams_count: u32) -> Value {
    send_json(ws, app_ready(instance_id, streams_count)).await;
    let ack = recv_json(ws).await;
    assert_eq!(ack["type"], "execute_ack");
    ack
}

/// Poll `check` until it holds or a few seconds have passed.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
