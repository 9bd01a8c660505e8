// ── Transaction history ──
//
// Bounded ring buffers of recent row changes, one per origin. Read only by
// diagnostics.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use strum::Display;

use crate::model::{DeviceId, EntityKind, ModelKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum HistoryAction {
    Insert,
    Update,
    Delete,
    /// Submitted but rejected or lost in transport.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    pub kind: EntityKind,
    pub key: ModelKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
    pub action: HistoryAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl HistoryEntry {
    pub fn new(
        kind: EntityKind,
        key: ModelKey,
        device_id: Option<DeviceId>,
        action: HistoryAction,
    ) -> Self {
        Self {
            at: Utc::now(),
            kind,
            key,
            device_id,
            action,
            detail: None,
        }
    }

    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

#[derive(Debug)]
pub struct TransactionHistory {
    capacity: usize,
    entries: Mutex<VecDeque<HistoryEntry>>,
}

impl TransactionHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
        }
    }

    /// Append, evicting the oldest entry when full.
    pub fn record(&self, entry: HistoryEntry) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<HistoryEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
