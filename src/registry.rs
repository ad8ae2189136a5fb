//! Peer Registry (C3).
//!
//! Holds every live peer, indexed by connection id and, once classified, by
//! device udid. Modeled on the teacher's `tunnel::relay::RelayState` /
//! `ConnectedDevice` (an `Arc<RwLock<HashMap<...>>>` with atomic heartbeat
//! timestamps and a `watch` channel for evicting a stale handler), generalized
//! here to also track controllers — the teacher only tracked devices in its
//! relay state, since its controllers were local websocket clients handled by
//! a separate module.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{mpsc, watch, RwLock};

/// A frame enqueued on a peer's write mailbox.
pub type Frame = Value;

/// Bounded mailbox capacity per peer (§4.3: "capacity >= 64 frames").
pub const MAILBOX_CAPACITY: usize = 64;

/// A single frame must not exceed this size at enqueue time (§4.3, §8).
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Unclassified,
    Controller,
    Device,
}

/// A live bidirectional message channel (§3 "Peer"). Exclusively owned by the
/// transport; the registry and broker hold `Arc` handles for lookup and
/// enqueue, never mutating the socket directly.
pub struct Peer {
    pub id: u64,
    role: RwLock<PeerRole>,
    device_udid: RwLock<Option<String>>,
    last_inbound_ms: AtomicI64,
    handshake_complete: AtomicBool,
    pub connected_since: Instant,
    mailbox: mpsc::Sender<Frame>,
    /// Flipped to `true` when a newer peer evicts this one with the same
    /// udid; the transport's read/write loops select on this to exit
    /// promptly instead of lingering after eviction.
    evicted: watch::Sender<bool>,
}

impl Peer {
    pub async fn role(&self) -> PeerRole {
        *self.role.read().await
    }

    async fn device_udid_async(&self) -> Option<String> {
        self.device_udid.read().await.clone()
    }
}

impl Peer {
    #[must_use]
    pub fn device_udid(&self) -> Option<String> {
        self.device_udid.try_read().ok().and_then(|g| g.clone())
    }

    #[must_use]
    pub fn last_inbound_ms(&self) -> i64 {
        self.last_inbound_ms.load(Ordering::Relaxed)
    }

    pub fn touch_inbound(&self, now_ms: i64) {
        self.last_inbound_ms.store(now_ms, Ordering::Relaxed);
    }

    #[must_use]
    pub fn handshake_complete(&self) -> bool {
        self.handshake_complete.load(Ordering::Relaxed)
    }

    pub fn mark_handshake_complete(&self) {
        self.handshake_complete.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_evicted(&self) -> bool {
        *self.evicted.borrow()
    }

    #[must_use]
    pub fn evicted_watcher(&self) -> watch::Receiver<bool> {
        self.evicted.subscribe()
    }

    /// Enqueue a frame onto this peer's write mailbox, rejecting anything
    /// over [`MAX_FRAME_BYTES`] before it ever reaches the socket.
    pub async fn send(&self, frame: Frame) -> Result<(), SendError> {
        let encoded_len = serde_json::to_vec(&frame).map(|v| v.len()).unwrap_or(usize::MAX);
        if encoded_len > MAX_FRAME_BYTES {
            return Err(SendError::FrameTooLarge);
        }
        self.mailbox.send(frame).await.map_err(|_| SendError::Closed)
    }

    /// Non-blocking enqueue used by the HTTP surface, where suspending on a
    /// full mailbox is not acceptable.
    pub fn try_send(&self, frame: Frame) -> Result<(), SendError> {
        let encoded_len = serde_json::to_vec(&frame).map(|v| v.len()).unwrap_or(usize::MAX);
        if encoded_len > MAX_FRAME_BYTES {
            return Err(SendError::FrameTooLarge);
        }
        self.mailbox.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::MailboxFull,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    FrameTooLarge,
    MailboxFull,
    Closed,
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::FrameTooLarge => write!(f, "frame exceeds the 16 MiB bound"),
            SendError::MailboxFull => write!(f, "peer mailbox is full"),
            SendError::Closed => write!(f, "peer is disconnected"),
        }
    }
}

/// A freshly constructed peer plus the receiving half of its mailbox, handed
/// back to the transport so it can spawn the writer task.
pub struct NewPeer {
    pub peer: Arc<Peer>,
    pub mailbox_rx: mpsc::Receiver<Frame>,
}

struct Inner {
    peers: HashMap<u64, Arc<Peer>>,
    by_udid: HashMap<String, u64>,
    device_states: HashMap<String, Value>,
}

/// Thread-safe registry of all live peers (§4.2). All operations are
/// serialized under a single lock with short (O(1)) critical sections.
pub struct Registry {
    inner: RwLock<Inner>,
    next_id: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                peers: HashMap::new(),
                by_udid: HashMap::new(),
                device_states: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a brand-new, as-yet-unclassified peer and return it along
    /// with the receiving half of its mailbox.
    pub async fn insert(&self) -> NewPeer {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let (evicted_tx, _) = watch::channel(false);
        let peer = Arc::new(Peer {
            id,
            role: RwLock::new(PeerRole::Unclassified),
            device_udid: RwLock::new(None),
            last_inbound_ms: AtomicI64::new(0),
            handshake_complete: AtomicBool::new(false),
            connected_since: Instant::now(),
            mailbox: tx,
            evicted: evicted_tx,
        });
        let mut inner = self.inner.write().await;
        inner.peers.insert(id, peer.clone());
        NewPeer { peer, mailbox_rx: rx }
    }

    /// Idempotently classify a peer as a controller.
    pub async fn classify_controller(&self, id: u64) {
        let inner = self.inner.read().await;
        if let Some(peer) = inner.peers.get(&id) {
            *peer.role.write().await = PeerRole::Controller;
            peer.mark_handshake_complete();
        }
    }

    /// Classify a peer as a device bound to `udid`. If another live peer
    /// already holds `udid`, it is evicted (its `evicted` watch flips to
    /// `true` and it is removed from the registry) atomically before this
    /// call returns. The evicted peer, if any, is returned so the caller can
    /// broadcast `device/disconnect` for it *before* forwarding anything from
    /// the new peer (§9 ordering requirement).
    pub async fn classify_device(&self, id: u64, udid: &str) -> Option<Arc<Peer>> {
        let mut inner = self.inner.write().await;
        let evicted = if let Some(&old_id) = inner.by_udid.get(udid) {
            if old_id != id {
                inner.peers.remove(&old_id)
            } else {
                None
            }
        } else {
            None
        };
        if let Some(old_peer) = &evicted {
            let _ = old_peer.evicted.send(true);
        }
        inner.by_udid.insert(udid.to_string(), id);
        if let Some(peer) = inner.peers.get(&id) {
            *peer.role.write().await = PeerRole::Device;
            *peer.device_udid.write().await = Some(udid.to_string());
            peer.mark_handshake_complete();
        }
        evicted
    }

    pub async fn lookup_by_udid(&self, udid: &str) -> Option<Arc<Peer>> {
        let inner = self.inner.read().await;
        let id = *inner.by_udid.get(udid)?;
        inner.peers.get(&id).cloned()
    }

    pub async fn lookup_by_id(&self, id: u64) -> Option<Arc<Peer>> {
        self.inner.read().await.peers.get(&id).cloned()
    }

    pub async fn all_controllers(&self) -> Vec<Arc<Peer>> {
        let inner = self.inner.read().await;
        let mut out = Vec::new();
        for peer in inner.peers.values() {
            if peer.role().await == PeerRole::Controller {
                out.push(peer.clone());
            }
        }
        out
    }

    pub async fn all_devices(&self) -> Vec<(String, Arc<Peer>)> {
        let inner = self.inner.read().await;
        inner
            .by_udid
            .iter()
            .filter_map(|(udid, id)| inner.peers.get(id).map(|p| (udid.clone(), p.clone())))
            .collect()
    }

    /// Remove a peer entirely (transport close). Returns the udid it was
    /// bound to, if it was a device.
    pub async fn remove(&self, id: u64) -> Option<String> {
        let mut inner = self.inner.write().await;
        let peer = inner.peers.remove(&id)?;
        let udid = peer.device_udid_async().await;
        if let Some(udid) = &udid {
            // Only clear the udid mapping if it still points at this peer —
            // a newer peer may already have taken it over via classify_device.
            if inner.by_udid.get(udid) == Some(&id) {
                inner.by_udid.remove(udid);
                inner.device_states.remove(udid);
            }
        }
        udid
    }

    /// Record the most recent `app/state` payload for a device.
    pub async fn update_device_state(&self, udid: &str, state: Value) {
        self.inner.write().await.device_states.insert(udid.to_string(), state);
    }

    /// `{udid: last_app_state}` for every device with a recorded state
    /// (devices that have connected but not yet sent `app/state` are
    /// omitted, matching the teacher's copy-on-update snapshot style).
    pub async fn snapshot_device_states(&self) -> HashMap<String, Value> {
        self.inner.read().await.device_states.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_then_classify_device_is_lookupable() {
        let registry = Registry::new();
        let new_peer = registry.insert().await;
        let id = new_peer.peer.id;
        registry.classify_device(id, "udid-a").await;
        let found = registry.lookup_by_udid("udid-a").await.unwrap();
        assert_eq!(found.id, id);
    }

    #[tokio::test]
    async fn second_classification_evicts_first() {
        let registry = Registry::new();
        let first = registry.insert().await;
        let first_id = first.peer.id;
        registry.classify_device(first_id, "udid-a").await;

        let second = registry.insert().await;
        let second_id = second.peer.id;
        let evicted = registry.classify_device(second_id, "udid-a").await;

        assert_eq!(evicted.unwrap().id, first_id);
        let found = registry.lookup_by_udid("udid-a").await.unwrap();
        assert_eq!(found.id, second_id);
        assert!(registry.lookup_by_id(first_id).await.is_none());
    }

    #[tokio::test]
    async fn remove_clears_udid_mapping() {
        let registry = Registry::new();
        let new_peer = registry.insert().await;
        let id = new_peer.peer.id;
        registry.classify_device(id, "udid-a").await;
        let removed_udid = registry.remove(id).await;
        assert_eq!(removed_udid.as_deref(), Some("udid-a"));
        assert!(registry.lookup_by_udid("udid-a").await.is_none());
    }

    #[tokio::test]
    async fn frame_over_bound_is_rejected() {
        let registry = Registry::new();
        let new_peer = registry.insert().await;
        let huge = serde_json::json!({ "blob": "a".repeat(MAX_FRAME_BYTES + 1) });
        assert_eq!(new_peer.peer.send(huge).await.unwrap_err(), SendError::FrameTooLarge);
    }
}
