//! Fan-out broadcast to the peers of one document room.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each peer gets an independent receiver that buffers up to `capacity`
//! frames. A peer that falls further behind lags, detects the sequence gap
//! and resyncs.
//!
//! Sequenced operations are echoed to their sender (that is how a client
//! confirms its pending mutations); signals and join notices are not.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

use crate::op::ClientId;
use crate::presence::UserInfo;
use crate::protocol::{ProtocolError, SyncMessage};

/// One encoded message on its way to the room.
#[derive(Debug, Clone)]
pub struct BroadcastFrame {
    pub origin: ClientId,
    /// Deliver to `origin` as well.
    pub echo: bool,
    pub bytes: Arc<Vec<u8>>,
}

impl BroadcastFrame {
    pub fn is_for(&self, client_id: &ClientId) -> bool {
        self.echo || &self.origin != client_id
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Atomic broadcast stats, so the send path never takes a lock.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// A broadcast group for a single document room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<BroadcastFrame>,

    /// Connected users in this room
    peers: Arc<RwLock<HashMap<ClientId, UserInfo>>>,

    capacity: usize,

    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` determines how many frames can be buffered per peer
    /// before a slow peer starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Add a peer and return its receiver. Re-adding an existing peer
    /// replaces its user info.
    pub async fn add_peer(&self, info: UserInfo) -> broadcast::Receiver<BroadcastFrame> {
        let mut peers = self.peers.write().await;
        peers.insert(info.client_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, client_id: &ClientId) -> Option<UserInfo> {
        let mut peers = self.peers.write().await;
        peers.remove(client_id)
    }

    /// Encode once and send to the room. Returns the number of receivers.
    pub fn broadcast(
        &self,
        origin: ClientId,
        msg: &SyncMessage,
        echo: bool,
    ) -> Result<usize, ProtocolError> {
        let bytes = Arc::new(msg.encode()?);
        Ok(self.broadcast_raw(BroadcastFrame {
            origin,
            echo,
            bytes,
        }))
    }

    /// Send a pre-encoded frame.
    pub fn broadcast_raw(&self, frame: BroadcastFrame) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging receiver skipped.
    pub fn record_dropped(&self, count: u64) {
        self.atomic_stats
            .messages_dropped
            .fetch_add(count, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<UserInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, client_id: &ClientId) -> bool {
        self.peers.read().await.contains_key(client_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastFrame> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn user(name: &str) -> UserInfo {
        UserInfo {
            client_id: Uuid::new_v4(),
            name: name.to_string(),
            color: 0x42F5A4,
        }
    }

    #[tokio::test]
    async fn test_broadcast_group_add_remove() {
        let group = BroadcastGroup::new(16);
        let alice = user("Alice");
        let id = alice.client_id;

        let _rx = group.add_peer(alice).await;
        assert_eq!(group.peer_count().await, 1);
        assert!(group.has_peer(&id).await);

        assert_eq!(group.remove_peer(&id).await.map(|u| u.name), Some("Alice".into()));
        assert_eq!(group.peer_count().await, 0);
        assert!(!group.has_peer(&id).await);
    }

    #[tokio::test]
    async fn test_broadcast_fan_out() {
        let group = BroadcastGroup::new(16);
        let alice = user("Alice");
        let bob = user("Bob");

        let mut rx1 = group.add_peer(alice.clone()).await;
        let mut rx2 = group.add_peer(bob.clone()).await;

        let msg = SyncMessage::ping(alice.client_id);
        assert_eq!(group.broadcast(alice.client_id, &msg, false).unwrap(), 2);

        // Every receiver sees the frame; filtering happens per session.
        let frame = rx1.recv().await.unwrap();
        assert!(!frame.is_for(&alice.client_id));
        let frame = rx2.recv().await.unwrap();
        assert!(frame.is_for(&bob.client_id));
        assert_eq!(SyncMessage::decode(&frame.bytes).unwrap(), msg);
    }

    #[tokio::test]
    async fn test_echo_frames_reach_origin() {
        let group = BroadcastGroup::new(16);
        let alice = user("Alice");
        let mut rx = group.add_peer(alice.clone()).await;

        group.broadcast_raw(BroadcastFrame {
            origin: alice.client_id,
            echo: true,
            bytes: Arc::new(vec![10, 20, 30]),
        });
        let frame = rx.recv().await.unwrap();
        assert!(frame.is_for(&alice.client_id));
        assert_eq!(*frame.bytes, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_lagging_receiver() {
        let group = BroadcastGroup::new(2);
        let alice = user("Alice");
        let mut rx = group.add_peer(alice.clone()).await;

        for _ in 0..5 {
            group.broadcast(alice.client_id, &SyncMessage::ping(alice.client_id), true).unwrap();
        }
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => group.record_dropped(n),
            other => panic!("expected lag, got {other:?}"),
        }
        let stats = group.stats().await;
        assert_eq!(stats.messages_sent, 5);
        assert_eq!(stats.messages_dropped, 3);
        assert_eq!(stats.active_peers, 1);
    }

    #[tokio::test]
    async fn test_peers_list() {
        let group = BroadcastGroup::new(16);
        let _rx1 = group.add_peer(user("Alice")).await;
        let _rx2 = group.add_peer(user("Bob")).await;

        let peers = group.peers().await;
        let names: Vec<&str> = peers.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(peers.len(), 2);
        assert!(names.contains(&"Alice"));
        assert!(names.contains(&"Bob"));
        assert_eq!(group.capacity(), 16);
    }
}
