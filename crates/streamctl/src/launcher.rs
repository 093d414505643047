// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Launch records of analytics processes.
//!
//! Starting the processes happens outside this crate (container exec,
//! config templating). The control plane only needs what was declared at
//! launch time to verify the handshake, plus a place to write back the PID
//! the process reports from inside its container.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// Lifecycle of a launched process as seen by the launcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchStatus {
    /// Recorded, `app_ready` not received yet
    Launching,
    Running,
    Stopped,
}

/// What was known about a process when it was started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchRecord {
    /// Launcher-side identifier
    pub process_id: String,
    pub instance_id: String,
    pub config_path: String,
    /// Stream capacity requested at launch, if any
    pub streams_count: Option<u32>,
    pub host_pid: Option<u32>,
    /// PID reported by the process itself in `app_ready`
    pub container_pid: Option<u32>,
    pub status: LaunchStatus,
    pub launched_at: DateTime<Utc>,
}

impl LaunchRecord {
    pub fn new(instance_id: impl Into<String>, config_path: impl Into<String>) -> Self {
        Self {
            process_id: Uuid::new_v4().to_string(),
            instance_id: instance_id.into(),
            config_path: config_path.into(),
            streams_count: None,
            host_pid: None,
            container_pid: None,
            status: LaunchStatus::Launching,
            launched_at: Utc::now(),
        }
    }

    pub fn with_streams_count(mut self, streams_count: u32) -> Self {
        self.streams_count = Some(streams_count);
        self
    }

    pub fn with_host_pid(mut self, pid: u32) -> Self {
        self.host_pid = Some(pid);
        self
    }

    /// Check the stream capacity reported by the process.
    ///
    /// Without a declared count at launch, any positive count is accepted.
    pub fn verify_streams_count(&self, reported: u32) -> bool {
        match self.streams_count {
            None => reported > 0,
            Some(expected) => expected == reported,
        }
    }
}

/// `{prefix}_{yymmdd}_{HHMMSS}_{8 hex}`
pub fn generate_instance_id(prefix: &str) -> String {
    let stamp = Utc::now().format("%y%m%d_%H%M%S");
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}_{}_{}", prefix, stamp, &suffix[..8])
}

/// Source of launch records.
pub trait ProcessLauncher: Send + Sync {
    /// Record a process started elsewhere. Replaces any previous record of
    /// the same instance.
    fn record_launch(&self, record: LaunchRecord);

    fn lookup(&self, instance_id: &str) -> Option<LaunchRecord>;

    /// Store the PID reported by the process and mark it running. Returns
    /// `false` if unknown.
    fn set_container_pid(&self, instance_id: &str, pid: u32) -> bool;

    fn mark_stopped(&self, instance_id: &str) -> bool;

    fn records(&self) -> Vec<LaunchRecord>;
}

/// Launch records kept in memory, keyed by instance id.
#[derive(Default)]
pub struct InMemoryLauncher {
    records: DashMap<String, LaunchRecord>,
}

impl InMemoryLauncher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProcessLauncher for InMemoryLauncher {
    fn record_launch(&self, record: LaunchRecord) {
        info!(
            "Launch recorded: {} (streams {:?}, config {})",
            record.instance_id, record.streams_count, record.config_path
        );
        self.records.insert(record.instance_id.clone(), record);
    }

    fn lookup(&self, instance_id: &str) -> Option<LaunchRecord> {
        self.records.get(instance_id).map(|r| r.clone())
    }

    fn set_container_pid(&self, instance_id: &str, pid: u32) -> bool {
        match self.records.get_mut(instance_id) {
            Some(mut record) => {
                record.container_pid = Some(pid);
                record.status = LaunchStatus::Running;
                info!("PID reported by {}: {}", instance_id, pid);
                true
            }
            None => {
                warn!("No launch record for instance '{}'", instance_id);
                false
            }
        }
    }

    fn mark_stopped(&self, instance_id: &str) -> bool {
        match self.records.get_mut(instance_id) {
            Some(mut record) => {
                record.status = LaunchStatus::Stopped;
                true
            }
            None => false,
        }
    }

    fn records(&self) -> Vec<LaunchRecord> {
        let mut records: Vec<LaunchRecord> = self.records.iter().map(|r| r.clone()).collect();
        records.sort_by_key(|r| r.launched_at);
        records
    }
}
