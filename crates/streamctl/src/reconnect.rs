// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Session resumption after a dropped connection.
//!
//! Instances that lost their session send `app_ready` again with the close
//! code of the previous session. Codes sent by this control plane on
//! shutdown (1001, 1013) mean the instance kept its work and its state is
//! restored as is; any other code is an ordinary reconnect.

use crate::allocator::model::{InstanceStatus, TransportStatus};
use crate::allocator::Allocator;
use crate::protocol::{close_code, AppReady};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Reconnect counters of one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconnectStats {
    pub reconnect_count: u64,
    pub last_close_code: Option<u16>,
    pub last_reconnect_at: Option<DateTime<Utc>>,
    pub restore_count: u64,
}

/// Close codes after which the previous session is restored.
pub fn is_restorable(code: u16) -> bool {
    matches!(code, close_code::GOING_AWAY | close_code::TRY_AGAIN_LATER)
}

pub struct ReconnectManager {
    allocator: Arc<Allocator>,
    stats: DashMap<String, ReconnectStats>,
}

impl ReconnectManager {
    pub fn new(allocator: Arc<Allocator>) -> Self {
        Self {
            allocator,
            stats: DashMap::new(),
        }
    }

    /// Handle a reconnecting `app_ready`. Returns whether the previous
    /// session was restored.
    pub fn handle_reconnection(&self, msg: &AppReady) -> bool {
        let restored = match msg.last_close_code {
            Some(code) if is_restorable(code) => {
                self.allocator.ensure_instance(
                    &msg.instance_id,
                    &msg.config_path,
                    msg.streams_count as usize,
                );
                self.allocator.update_instance_status(
                    &msg.instance_id,
                    Some(InstanceStatus::Idle),
                    Some(TransportStatus::Connected),
                )
            }
            _ => false,
        };

        let mut stats = self.stats.entry(msg.instance_id.clone()).or_default();
        stats.reconnect_count += 1;
        stats.last_close_code = msg.last_close_code;
        stats.last_reconnect_at = Some(Utc::now());
        if restored {
            stats.restore_count += 1;
        }

        info!(
            "Instance '{}' reconnected (close code {:?}, restored: {}, count: {})",
            msg.instance_id, msg.last_close_code, restored, stats.reconnect_count
        );
        restored
    }

    pub fn stats(&self, instance_id: &str) -> Option<ReconnectStats> {
        self.stats.get(instance_id).map(|s| s.clone())
    }

    pub fn all_stats(&self) -> Vec<(String, ReconnectStats)> {
        let mut all: Vec<(String, ReconnectStats)> = self
            .stats
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ReplyStatus;

    fn app_ready(code: Option<u16>) -> AppReady {
        AppReady {
            request_id: "r".into(),
            instance_id: "A".into(),
            config_path: "/cfg".into(),
            process_id: 10,
            streams_count: 2,
            status: ReplyStatus::Ok,
            version: None,
            start_time: None,
            reconnect: true,
            last_close_code: code,
        }
    }

    #[test]
    fn test_going_away_restores() {
        let allocator = Arc::new(Allocator::new());
        allocator.register_instance("A", "/cfg", 2);
        allocator.update_instance_status(
            "A",
            Some(InstanceStatus::Disconnected),
            Some(TransportStatus::Disconnected),
        );
        let manager = ReconnectManager::new(allocator.clone());

        assert!(manager.handle_reconnection(&app_ready(Some(close_code::GOING_AWAY))));

        let info = allocator.instance_info("A").unwrap();
        assert_eq!(info.status, InstanceStatus::Idle);
        assert_eq!(info.ws_status, TransportStatus::Connected);

        let stats = manager.stats("A").unwrap();
        assert_eq!(stats.reconnect_count, 1);
        assert_eq!(stats.restore_count, 1);
        assert_eq!(stats.last_close_code, Some(1001));
    }

    #[test]
    fn test_abnormal_close_is_plain_reconnect() {
        let allocator = Arc::new(Allocator::new());
        let manager = ReconnectManager::new(allocator.clone());

        assert!(!manager.handle_reconnection(&app_ready(Some(1006))));
        assert!(!manager.handle_reconnection(&app_ready(None)));

        let stats = manager.stats("A").unwrap();
        assert_eq!(stats.reconnect_count, 2);
        assert_eq!(stats.restore_count, 0);
        assert_eq!(stats.last_close_code, None);
        assert!(!allocator.contains("A"));
    }

    #[test]
    fn test_restorable_codes() {
        assert!(is_restorable(1001));
        assert!(is_restorable(1013));
        assert!(!is_restorable(1000));
        assert!(!is_restorable(1006));
    }
}
