// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Correlation of outbound requests with their replies.
//!
//! Every request sent to an instance is recorded by request id. A reply
//! resolves the entry only when its kind is the one that answers the
//! request kind; anything else leaves the entry pending. Callers that need
//! the reply keep the returned receiver and bound their wait themselves.

use crate::protocol::{InboundMessage, MessageKind};
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

struct PendingRequest {
    instance_id: String,
    kind: MessageKind,
    sent_at: Instant,
    responder: oneshot::Sender<InboundMessage>,
}

/// Pending request summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingInfo {
    pub request_id: String,
    pub instance_id: String,
    pub kind: MessageKind,
    pub age: Duration,
}

/// Map of request id to pending request.
#[derive(Default)]
pub struct RequestTracker {
    pending: DashMap<String, PendingRequest>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an outbound request. Drop the receiver if the reply is not
    /// awaited.
    pub fn register(
        &self,
        request_id: &str,
        instance_id: &str,
        kind: MessageKind,
    ) -> oneshot::Receiver<InboundMessage> {
        let (responder, rx) = oneshot::channel();
        let previous = self.pending.insert(
            request_id.to_string(),
            PendingRequest {
                instance_id: instance_id.to_string(),
                kind,
                sent_at: Instant::now(),
                responder,
            },
        );
        if previous.is_some() {
            warn!("Request id {} reused, previous waiter dropped", request_id);
        }
        rx
    }

    /// Match a reply against its pending request.
    ///
    /// Returns `true` if a pending request was resolved.
    pub fn resolve(&self, msg: &InboundMessage) -> bool {
        let request_id = msg.request_id();
        let kind = msg.kind();

        let Some((_, pending)) = self
            .pending
            .remove_if(request_id, |_, p| p.kind.reply_kind() == Some(kind))
        else {
            return false;
        };

        debug!(
            "Request {} ({:?}) answered by '{}' after {:?}",
            request_id,
            pending.kind,
            pending.instance_id,
            pending.sent_at.elapsed()
        );
        // The waiter may have given up already.
        let _ = pending.responder.send(msg.clone());
        true
    }

    /// Forget a request. Its waiter sees a closed channel.
    pub fn abandon(&self, request_id: &str) -> bool {
        self.pending.remove(request_id).is_some()
    }

    /// Abandon requests older than `max_age`. Returns how many were dropped.
    pub fn expire(&self, max_age: Duration) -> usize {
        let before = self.pending.len();
        self.pending.retain(|request_id, p| {
            let keep = p.sent_at.elapsed() < max_age;
            if !keep {
                debug!(
                    "Abandoning {:?} request {} to '{}'",
                    p.kind, request_id, p.instance_id
                );
            }
            keep
        });
        before.saturating_sub(self.pending.len())
    }

    pub fn pending(&self) -> Vec<PendingInfo> {
        let mut infos: Vec<PendingInfo> = self
            .pending
            .iter()
            .map(|e| PendingInfo {
                request_id: e.key().clone(),
                instance_id: e.instance_id.clone(),
                kind: e.kind,
                age: e.sent_at.elapsed(),
            })
            .collect();
        infos.sort_by(|a, b| b.age.cmp(&a.age));
        infos
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode, AppTerminated};

    fn terminated(request_id: &str, status: &str) -> InboundMessage {
        InboundMessage::AppTerminated(AppTerminated {
            request_id: request_id.into(),
            status: status.into(),
            message: String::new(),
        })
    }

    #[tokio::test]
    async fn test_resolve_delivers_reply() {
        let tracker = RequestTracker::new();
        let rx = tracker.register("t1", "A", MessageKind::TerminateApp);
        assert_eq!(tracker.len(), 1);

        assert!(tracker.resolve(&terminated("t1", "OK")));
        assert!(tracker.is_empty());

        match rx.await.unwrap() {
            InboundMessage::AppTerminated(m) => assert!(m.acknowledged()),
            other => panic!("Expected AppTerminated, got {:?}", other),
        }
    }

    #[test]
    fn test_mismatched_kind_stays_pending() {
        let tracker = RequestTracker::new();
        let _rx = tracker.register("q1", "A", MessageKind::QueryMetrics);

        assert!(!tracker.resolve(&terminated("q1", "OK")));
        assert_eq!(tracker.len(), 1);

        let reply = decode(
            r#"{"type": "metrics_response", "request_id": "q1",
                "cpu_percent": 1.0, "ram_mb": 2.0, "gpu_percent": 3.0, "vram_mb": 4.0}"#,
        )
        .unwrap();
        assert!(tracker.resolve(&reply));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_unknown_request_id() {
        let tracker = RequestTracker::new();
        assert!(!tracker.resolve(&terminated("nope", "OK")));
    }

    #[tokio::test]
    async fn test_abandon_closes_waiter() {
        let tracker = RequestTracker::new();
        let rx = tracker.register("t1", "A", MessageKind::TerminateApp);
        assert!(tracker.abandon("t1"));
        assert!(!tracker.abandon("t1"));
        assert!(rx.await.is_err());
    }

    #[test]
    fn test_expire_old_requests() {
        let tracker = RequestTracker::new();
        let _a = tracker.register("a", "A", MessageKind::StartAnalysis);
        let _b = tracker.register("b", "B", MessageKind::PushFile);

        assert_eq!(tracker.expire(Duration::from_secs(60)), 0);
        assert_eq!(tracker.expire(Duration::ZERO), 2);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_resolve_after_waiter_dropped() {
        let tracker = RequestTracker::new();
        drop(tracker.register("t1", "A", MessageKind::TerminateApp));
        assert!(tracker.resolve(&terminated("t1", "error")));
    }
}
