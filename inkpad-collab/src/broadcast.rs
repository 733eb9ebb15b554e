//! Fan-out broadcast to the other sessions of a page.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each session gets an independent receiver that buffers up to
//! `capacity` messages; a lagging receiver drops oldest messages
//! (backpressure) and recovers on the next full resync.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, SessionInfo, SyncMessage};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub active_sessions: usize,
}

/// Lock-free counters for the broadcast hot path.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
}

/// A broadcast group for a single page.
///
/// All sessions viewing the same page share one channel. When one session
/// sends a merged delta, it's fanned out to the N-1 other sessions
/// (filtering out the sender is the receiver loop's job).
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    /// Connected sessions on this page.
    sessions: RwLock<HashMap<Uuid, SessionInfo>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// Create a new broadcast group buffering up to `capacity` messages
    /// per receiver.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sessions: RwLock::new(HashMap::new()),
            capacity,
            stats: AtomicBroadcastStats {
                messages_sent: AtomicU64::new(0),
            },
        }
    }

    /// Add a session to this group. Returns its receiver.
    pub async fn add_session(&self, info: SessionInfo) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(info.session_id, info);
        self.sender.subscribe()
    }

    /// Remove a session from this group.
    pub async fn remove_session(&self, session_id: &Uuid) -> Option<SessionInfo> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(session_id)
    }

    /// Broadcast a message to every receiver.
    ///
    /// The message is encoded once and shared; no lock is taken.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Broadcast pre-encoded bytes directly (zero-copy fast path).
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn has_session(&self, session_id: &Uuid) -> bool {
        self.sessions.read().await.contains_key(session_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let sessions = self.sessions.read().await;
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            active_sessions: sessions.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Subscribe without registering a session (monitoring).
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }
}
