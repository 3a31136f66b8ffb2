//! Append-only ledger of every action the controller has taken.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::types::{ActionKind, Trigger};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: Uuid,
    pub action: ActionKind,
    pub service: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub message: String,
    pub trigger: Trigger,
}

impl ActionRecord {
    pub fn new(
        action: ActionKind,
        service: impl Into<String>,
        success: bool,
        message: impl Into<String>,
        trigger: Trigger,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            action,
            service: service.into(),
            timestamp: Utc::now(),
            success,
            message: message.into(),
            trigger,
        }
    }
}

/// Records kept in memory. Older records are dropped but still counted.
pub const MAX_RETAINED: usize = 2000;

/// Insertion-ordered action log. Every append is also broadcast to live
/// subscribers (the `/api/events` stream).
#[derive(Debug)]
pub struct HistoryLog {
    records: VecDeque<ActionRecord>,
    total: usize,
    capacity: usize,
    tx: broadcast::Sender<ActionRecord>,
}

impl Default for HistoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryLog {
    pub fn new() -> Self {
        Self::with_capacity(MAX_RETAINED)
    }

    /// A log that keeps at most `capacity` records (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            records: VecDeque::new(),
            total: 0,
            capacity: capacity.max(1),
            tx,
        }
    }

    pub fn append(&mut self, record: ActionRecord) {
        // No subscribers is the normal case; the send result is irrelevant.
        let _ = self.tx.send(record.clone());
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
        self.total += 1;
    }

    /// The newest `limit` records, most recent first.
    pub fn recent(&self, limit: usize) -> Vec<ActionRecord> {
        self.records.iter().rev().take(limit).cloned().collect()
    }

    /// Records ever appended, including those no longer retained.
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Retained records, oldest first.
    pub fn records(&self) -> impl Iterator<Item = &ActionRecord> {
        self.records.iter()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ActionRecord> {
        self.tx.subscribe()
    }

    pub fn sender(&self) -> broadcast::Sender<ActionRecord> {
        self.tx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(action: ActionKind, service: &str) -> ActionRecord {
        ActionRecord::new(action, service, true, "ok", Trigger::Auto)
    }

    #[test]
    fn recent_is_most_recent_first_and_bounded() {
        let mut log = HistoryLog::new();
        for i in 0..60 {
            log.append(record(ActionKind::Deploy, &format!("svc-{i}")));
        }
        let recent = log.recent(50);
        assert_eq!(recent.len(), 50);
        assert_eq!(recent[0].service, "svc-59");
        assert_eq!(recent[49].service, "svc-10");
        assert_eq!(log.len(), 60);
    }

    #[test]
    fn recent_on_short_log_returns_everything() {
        let mut log = HistoryLog::new();
        log.append(record(ActionKind::Restart, "orders"));
        assert_eq!(log.recent(50).len(), 1);
        assert!(!log.is_empty());
    }

    #[test]
    fn retention_drops_oldest_but_keeps_total() {
        let mut log = HistoryLog::with_capacity(3);
        for i in 0..5 {
            log.append(record(ActionKind::Deploy, &format!("svc-{i}")));
        }
        assert_eq!(log.len(), 5);
        let services: Vec<&str> = log.records().map(|r| r.service.as_str()).collect();
        assert_eq!(services, ["svc-2", "svc-3", "svc-4"]);
        assert_eq!(log.recent(50)[0].service, "svc-4");
    }

    #[tokio::test]
    async fn appends_are_broadcast() {
        let mut log = HistoryLog::new();
        let mut rx = log.subscribe();
        log.append(record(ActionKind::Rollback, "orders"));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.action, ActionKind::Rollback);
        assert_eq!(got.service, "orders");
    }

    #[test]
    fn record_serializes_action_in_snake_case() {
        let json = serde_json::to_value(record(ActionKind::Deploy, "orders")).unwrap();
        assert_eq!(json["action"], "deploy");
        assert_eq!(json["trigger"], "auto");
        assert_eq!(json["success"], true);
    }
}
