//! Users, colors and ephemeral signals.
//!
//! Presence never touches document state. The server assigns every user
//! a color when they join; clients keep the list of connected users and
//! the latest value of each signal (cursor position, selection, ...) per
//! peer.
//!
//! ```text
//! local cursor move
//!       │
//!       ▼
//! SignalThrottle::admit("cursor")   (rate-limited: 30fps)
//!       │
//!       ▼
//! SyncMessage::Signal ──► server ──► other peers
//!                                        │
//!                                        ▼
//!                             PresenceRoom::handle_signal()
//! ```

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::op::ClientId;
use crate::protocol::SignalMessage;
use crate::value::Value;

/// Signal carrying the local cursor position.
pub const CURSOR_SIGNAL: &str = "cursor";
/// Signal carrying the ids of selected hit objects.
pub const SELECTION_SIGNAL: &str = "selection";

/// User color palette, handed out in order.
pub const USER_COLORS: [u32; 9] = [
    0xFF4B60, 0xFFA14B, 0xF5DD42, 0x90F542, 0x42F5A4, 0x2FD1ED, 0x3455F7, 0xA635FC, 0xE329AB,
];

/// First palette color nobody uses yet. When all are taken every new user
/// gets the last one.
pub fn pick_color(in_use: impl IntoIterator<Item = u32>) -> u32 {
    let used: Vec<u32> = in_use.into_iter().collect();
    USER_COLORS
        .iter()
        .copied()
        .find(|c| !used.contains(c))
        .unwrap_or(USER_COLORS[USER_COLORS.len() - 1])
}

/// A connected user as announced by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub client_id: ClientId,
    pub name: String,
    /// 0xRRGGBB
    pub color: u32,
}

impl UserInfo {
    pub fn color_rgba(&self) -> [f32; 4] {
        let r = ((self.color >> 16) & 0xFF) as f32 / 255.0;
        let g = ((self.color >> 8) & 0xFF) as f32 / 255.0;
        let b = (self.color & 0xFF) as f32 / 255.0;
        [r, g, b, 1.0]
    }
}

/// Rate limits outgoing signals by name. Names without a configured
/// interval always pass.
#[derive(Debug, Clone)]
pub struct SignalThrottle {
    intervals: HashMap<String, Duration>,
    last_sent: HashMap<String, Instant>,
}

impl Default for SignalThrottle {
    fn default() -> Self {
        Self::new().with_interval(CURSOR_SIGNAL, Duration::from_millis(33))
    }
}

impl SignalThrottle {
    pub fn new() -> Self {
        Self {
            intervals: HashMap::new(),
            last_sent: HashMap::new(),
        }
    }

    pub fn with_interval(mut self, name: impl Into<String>, interval: Duration) -> Self {
        self.intervals.insert(name.into(), interval);
        self
    }

    /// Whether a signal named `name` may go out now. Records the send
    /// when it may.
    pub fn admit(&mut self, name: &str) -> bool {
        let Some(interval) = self.intervals.get(name) else {
            return true;
        };
        let now = Instant::now();
        if let Some(last) = self.last_sent.get(name) {
            if now.duration_since(*last) < *interval {
                return false;
            }
        }
        self.last_sent.insert(name.to_string(), now);
        true
    }
}

/// Remote peer tracked by a client.
#[derive(Debug, Clone)]
pub struct RemotePeer {
    pub user: UserInfo,
    /// Latest content per signal name.
    pub signals: HashMap<String, Value>,
    last_update: Instant,
}

impl RemotePeer {
    fn new(user: UserInfo) -> Self {
        Self {
            user,
            signals: HashMap::new(),
            last_update: Instant::now(),
        }
    }

    pub fn signal(&self, name: &str) -> Option<&Value> {
        self.signals.get(name)
    }

    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_update.elapsed() > timeout
    }
}

/// Client-side view of everyone in the document room.
#[derive(Debug, Clone)]
pub struct PresenceRoom {
    local: Option<UserInfo>,
    peers: HashMap<ClientId, RemotePeer>,
}

impl Default for PresenceRoom {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceRoom {
    pub fn new() -> Self {
        Self {
            local: None,
            peers: HashMap::new(),
        }
    }

    /// Reset from the user list of an `InitialState`.
    pub fn reset(&mut self, local: UserInfo, connected: Vec<UserInfo>) {
        self.peers.clear();
        for user in connected {
            if user.client_id != local.client_id {
                self.peers.insert(user.client_id, RemotePeer::new(user));
            }
        }
        self.local = Some(local);
    }

    pub fn local_user(&self) -> Option<&UserInfo> {
        self.local.as_ref()
    }

    pub fn handle_joined(&mut self, user: UserInfo) {
        if self.is_local(&user.client_id) {
            return;
        }
        self.peers
            .entry(user.client_id)
            .and_modify(|peer| peer.user = user.clone())
            .or_insert_with(|| RemotePeer::new(user));
    }

    pub fn handle_left(&mut self, client_id: &ClientId) -> Option<UserInfo> {
        self.peers.remove(client_id).map(|peer| peer.user)
    }

    /// Record a signal from a peer. Signals from unknown peers are ignored.
    pub fn handle_signal(&mut self, from: &ClientId, signal: &SignalMessage) -> bool {
        if self.is_local(from) {
            return false;
        }
        match self.peers.get_mut(from) {
            Some(peer) => {
                peer.signals.insert(signal.name.clone(), signal.content.clone());
                peer.last_update = Instant::now();
                true
            }
            None => false,
        }
    }

    fn is_local(&self, client_id: &ClientId) -> bool {
        self.local.as_ref().is_some_and(|u| &u.client_id == client_id)
    }

    pub fn peer(&self, client_id: &ClientId) -> Option<&RemotePeer> {
        self.peers.get(client_id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &RemotePeer> {
        self.peers.values()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Drop signal values of peers that went quiet. The peers stay listed.
    pub fn clear_idle_signals(&mut self, timeout: Duration) -> Vec<ClientId> {
        let mut cleared = Vec::new();
        for (id, peer) in self.peers.iter_mut() {
            if !peer.signals.is_empty() && peer.is_idle(timeout) {
                peer.signals.clear();
                cleared.push(*id);
            }
        }
        cleared
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn user(name: &str, color: u32) -> UserInfo {
        UserInfo {
            client_id: Uuid::new_v4(),
            name: name.to_string(),
            color,
        }
    }

    #[test]
    fn test_pick_first_unused_color() {
        assert_eq!(pick_color([]), 0xFF4B60);
        assert_eq!(pick_color([0xFF4B60, 0xF5DD42]), 0xFFA14B);
    }

    #[test]
    fn test_pick_color_exhausted_palette() {
        assert_eq!(pick_color(USER_COLORS), 0xE329AB);
    }

    #[test]
    fn test_color_rgba() {
        let rgba = user("a", 0xFF0000).color_rgba();
        assert_eq!(rgba, [1.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_throttle_cursor_only() {
        let mut throttle = SignalThrottle::default();
        assert!(throttle.admit(CURSOR_SIGNAL));
        assert!(!throttle.admit(CURSOR_SIGNAL));
        assert!(throttle.admit(SELECTION_SIGNAL));
        assert!(throttle.admit(SELECTION_SIGNAL));
    }

    #[test]
    fn test_throttle_releases_after_interval() {
        let mut throttle = SignalThrottle::new().with_interval("x", Duration::from_millis(1));
        assert!(throttle.admit("x"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(throttle.admit("x"));
    }

    #[test]
    fn test_room_tracks_peers_and_signals() {
        let me = user("me", USER_COLORS[0]);
        let bob = user("bob", USER_COLORS[1]);
        let mut room = PresenceRoom::new();
        room.reset(me.clone(), vec![me.clone(), bob.clone()]);
        assert_eq!(room.peer_count(), 1);

        let signal = SignalMessage {
            name: CURSOR_SIGNAL.into(),
            content: Value::Vec2(osucad_core::Vec2::new(10.0, 20.0)),
        };
        assert!(room.handle_signal(&bob.client_id, &signal));
        assert!(!room.handle_signal(&me.client_id, &signal));
        assert_eq!(
            room.peer(&bob.client_id).unwrap().signal(CURSOR_SIGNAL),
            Some(&signal.content)
        );

        assert_eq!(room.handle_left(&bob.client_id), Some(bob.clone()));
        assert!(!room.handle_signal(&bob.client_id, &signal));
    }

    #[test]
    fn test_own_join_is_ignored() {
        let me = user("me", USER_COLORS[0]);
        let mut room = PresenceRoom::new();
        room.reset(me.clone(), Vec::new());
        room.handle_joined(me);
        assert_eq!(room.peer_count(), 0);
    }

    #[test]
    fn test_idle_signals_are_cleared() {
        let me = user("me", USER_COLORS[0]);
        let bob = user("bob", USER_COLORS[1]);
        let mut room = PresenceRoom::new();
        room.reset(me, vec![bob.clone()]);
        room.handle_signal(
            &bob.client_id,
            &SignalMessage {
                name: SELECTION_SIGNAL.into(),
                content: Value::List(Vec::new()),
            },
        );
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(room.clear_idle_signals(Duration::from_millis(1)), vec![bob.client_id]);
        assert_eq!(room.peer_count(), 1);
    }
}
