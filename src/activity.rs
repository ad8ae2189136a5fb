//! In-memory activity journal with real-time broadcast (C12).
//!
//! Tracks broker-level events — envelope errors, fan-outs, peer evictions,
//! update-stage transitions — in a fixed-size ring buffer and broadcasts each
//! new entry to connected controllers, reusing the same broadcast channel the
//! broker already fans device envelopes out on. Directly grounded on the
//! teacher's `activity::ActivityLog`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, RwLock};

/// Categories of activity tracked by the journal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    PeerConnected,
    PeerClassified,
    PeerEvicted,
    PeerDisconnected,
    FanOut,
    EnvelopeMalformed,
    SignatureRejected,
    TransferStarted,
    TransferCompleted,
    UpdateStageChanged,
    TurnCredentialIssued,
}

/// A single activity journal entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: u64,
    pub timestamp_ms: u64,
    pub kind: ActivityKind,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// In-memory ring buffer of activity entries with broadcast support.
pub struct ActivityLog {
    entries: RwLock<VecDeque<ActivityEntry>>,
    next_id: AtomicU64,
    max_entries: usize,
    malformed_envelopes: AtomicU64,
    broadcast_tx: broadcast::Sender<Value>,
}

impl ActivityLog {
    #[must_use]
    pub fn new(max_entries: usize, broadcast_tx: broadcast::Sender<Value>) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(max_entries)),
            next_id: AtomicU64::new(1),
            max_entries,
            malformed_envelopes: AtomicU64::new(0),
            broadcast_tx,
        }
    }

    /// Append an entry, broadcast it, and return the assigned id.
    pub async fn log(
        &self,
        kind: ActivityKind,
        summary: impl Into<String>,
        detail: Option<Value>,
        request_id: Option<String>,
    ) -> u64 {
        if kind == ActivityKind::EnvelopeMalformed {
            self.malformed_envelopes.fetch_add(1, Ordering::Relaxed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        #[allow(clippy::cast_possible_truncation)]
        let timestamp_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        let entry = ActivityEntry {
            id,
            timestamp_ms,
            kind,
            summary: summary.into(),
            detail,
            request_id,
        };

        // Broadcast before taking the write lock, matching the teacher's
        // non-blocking-for-readers ordering.
        let _ = self.broadcast_tx.send(json!({ "type": "activity.new", "entry": &entry }));

        let mut entries = self.entries.write().await;
        if entries.len() >= self.max_entries {
            entries.pop_front();
        }
        entries.push_back(entry);
        id
    }

    /// Observability counter required by §7 `EnvelopeMalformed`.
    #[must_use]
    pub fn malformed_envelope_count(&self) -> u64 {
        self.malformed_envelopes.load(Ordering::Relaxed)
    }

    pub async fn read_since(&self, since_id: u64, limit: usize) -> Vec<ActivityEntry> {
        let entries = self.entries.read().await;
        entries.iter().filter(|e| e.id > since_id).take(limit).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_assigns_monotonic_ids_and_counts_malformed() {
        let (tx, _rx) = broadcast::channel(16);
        let log = ActivityLog::new(4, tx);
        let a = log.log(ActivityKind::PeerConnected, "peer connected", None, None).await;
        let b = log.log(ActivityKind::EnvelopeMalformed, "bad json", None, None).await;
        assert!(b > a);
        assert_eq!(log.malformed_envelope_count(), 1);
    }

    #[tokio::test]
    async fn ring_buffer_drops_oldest_past_capacity() {
        let (tx, _rx) = broadcast::channel(16);
        let log = ActivityLog::new(2, tx);
        for i in 0..5 {
            log.log(ActivityKind::FanOut, format!("entry {i}"), None, None).await;
        }
        let all = log.read_since(0, 100).await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].summary, "entry 3");
    }
}
