//! Fan-out broadcast to the peers of one document.
//!
//! Uses tokio broadcast channels: one send reaches every subscriber, and each
//! peer buffers up to `capacity` messages before it starts lagging.
//! The group also remembers each peer's latest presence message so late
//! joiners can be brought up to date. That cache lives in memory only.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Counters kept outside the peer lock so the send path never waits.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
    /// Last encoded awareness message per peer.
    presence: RwLock<HashMap<Uuid, Arc<Vec<u8>>>>,
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            presence: RwLock::new(HashMap::new()),
            capacity,
            atomic_stats: AtomicBroadcastStats {
                messages_sent: AtomicU64::new(0),
                messages_dropped: AtomicU64::new(0),
            },
        }
    }

    /// Register a peer and return its receiver.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut peers = self.peers.write().await;
        peers.insert(info.peer_id, info);
        self.sender.subscribe()
    }

    /// Unregister a peer and forget its presence.
    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.presence.write().await.remove(peer_id);
        self.peers.write().await.remove(peer_id)
    }

    /// Send to every subscriber. Filtering out the sender is the receiver's job.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        Ok(self.broadcast_raw(Arc::new(msg.encode()?)))
    }

    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for messages a lagging receiver skipped.
    pub fn record_dropped(&self, n: u64) {
        self.atomic_stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn remember_presence(&self, peer_id: Uuid, encoded: Arc<Vec<u8>>) {
        self.presence.write().await.insert(peer_id, encoded);
    }

    pub async fn forget_presence(&self, peer_id: &Uuid) {
        self.presence.write().await.remove(peer_id);
    }

    /// Stored presence of every peer except `exclude`.
    pub async fn presence_snapshot(&self, exclude: Uuid) -> Vec<Arc<Vec<u8>>> {
        self.presence
            .read()
            .await
            .iter()
            .filter(|(peer_id, _)| **peer_id != exclude)
            .map(|(_, encoded)| encoded.clone())
            .collect()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }
}
