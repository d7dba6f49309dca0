// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Change notifications for the UI layer.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::types::DownloadStatus;

/// Something the UI may want to redraw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OfflineEvent {
    /// Percent done, or -1 when the size is unknown
    Progress { id: String, percent: i32 },
    Completed { id: String },
    Error { id: String, message: String },
    StatusChanged { id: String, status: DownloadStatus },
    /// Entries were added, removed or changed status
    ListChanged,
    StorageUsage { total_bytes: u64 },
}

impl OfflineEvent {
    /// Entry the event is about, if any.
    pub fn id(&self) -> Option<&str> {
        match self {
            OfflineEvent::Progress { id, .. }
            | OfflineEvent::Completed { id }
            | OfflineEvent::Error { id, .. }
            | OfflineEvent::StatusChanged { id, .. } => Some(id),
            OfflineEvent::ListChanged | OfflineEvent::StorageUsage { .. } => None,
        }
    }
}

/// Fan-out of [`OfflineEvent`]s to any number of subscribers.
///
/// Slow subscribers lag and miss events rather than blocking transfers.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OfflineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// New receiver seeing every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<OfflineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: OfflineEvent) {
        // Err only means nobody is listening
        if let Err(broadcast::error::SendError(event)) = self.tx.send(event) {
            tracing::trace!(?event, "Dropped event with no subscribers");
        }
    }
}
