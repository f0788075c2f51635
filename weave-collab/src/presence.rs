//! Presence protocol: who is on the canvas and what they are doing.
//!
//! ```text
//! set_local_presence(update)
//!       │  (cursor-only updates throttled)
//!       ▼
//! AwarenessMessage::State { clock, record }
//!       │   (SyncMessage::Awareness, relayed by the server)
//!       ▼
//! Remote PresenceRoom::handle_message()   ── stale clocks dropped
//!       │
//!       ▼
//! on_presence_change() receivers get the full participant list
//! ```
//!
//! Presence is ephemeral. The server keeps only the latest message per peer
//! in memory so late joiners see everyone; nothing here is ever persisted.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::mpsc::Receiver;
use std::time::{Duration, Instant};
use uuid::Uuid;
use weave_core::{Emitter, Point};

use crate::protocol::ProtocolError;

/// Default minimum interval between two cursor-only broadcasts (~30 fps).
pub const CURSOR_THROTTLE: Duration = Duration::from_millis(33);

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// RGBA color for cursor rendering.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, vivid color derived from a UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        let hue = ((id.as_u128() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// Caret inside a block's text body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingState {
    pub block_id: String,
    pub caret: u32,
}

/// One participant's ephemeral state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub peer_id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub color: CursorColor,
    pub cursor: Option<Point>,
    pub typing: Option<TypingState>,
    /// Block currently being dragged.
    pub dragging: Option<String>,
}

impl PresenceRecord {
    pub fn new(peer_id: Uuid, user_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            user_id,
            name: name.into(),
            color: CursorColor::from_uuid(user_id),
            cursor: None,
            typing: None,
            dragging: None,
        }
    }
}

/// Partial presence change. `None` leaves a field as it is; `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresenceUpdate {
    pub name: Option<String>,
    pub cursor: Option<Option<Point>>,
    pub typing: Option<Option<TypingState>>,
    pub dragging: Option<Option<String>>,
}

impl PresenceUpdate {
    pub fn cursor(point: Point) -> Self {
        Self {
            cursor: Some(Some(point)),
            ..Self::default()
        }
    }

    pub fn typing(block_id: impl Into<String>, caret: u32) -> Self {
        Self {
            typing: Some(Some(TypingState {
                block_id: block_id.into(),
                caret,
            })),
            ..Self::default()
        }
    }

    pub fn stop_typing() -> Self {
        Self {
            typing: Some(None),
            ..Self::default()
        }
    }

    pub fn dragging(block_id: impl Into<String>) -> Self {
        Self {
            dragging: Some(Some(block_id.into())),
            ..Self::default()
        }
    }

    pub fn stop_dragging() -> Self {
        Self {
            dragging: Some(None),
            ..Self::default()
        }
    }

    fn is_cursor_only(&self) -> bool {
        self.cursor.is_some() && self.name.is_none() && self.typing.is_none() && self.dragging.is_none()
    }

    /// Merge into `record`. Returns whether anything changed.
    fn merge_into(self, record: &mut PresenceRecord) -> bool {
        let before = record.clone();
        if let Some(name) = self.name {
            record.name = name;
        }
        if let Some(cursor) = self.cursor {
            record.cursor = cursor;
        }
        if let Some(typing) = self.typing {
            record.typing = typing;
        }
        if let Some(dragging) = self.dragging {
            record.dragging = dragging;
        }
        *record != before
    }
}

// ───────────────────────────────────────────────────────────────────
// Wire messages
// ───────────────────────────────────────────────────────────────────

/// Carried inside `SyncMessage::Awareness` payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AwarenessMessage {
    /// Full current record of a peer.
    State { clock: u64, record: PresenceRecord },
    /// The peer cleared its presence.
    Leave { peer_id: Uuid, clock: u64 },
}

impl AwarenessMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    pub fn peer_id(&self) -> Uuid {
        match self {
            AwarenessMessage::State { record, .. } => record.peer_id,
            AwarenessMessage::Leave { peer_id, .. } => *peer_id,
        }
    }

    pub fn clock(&self) -> u64 {
        match self {
            AwarenessMessage::State { clock, .. } | AwarenessMessage::Leave { clock, .. } => *clock,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Presence room
// ───────────────────────────────────────────────────────────────────

/// Local and remote presence for one document, as seen by one client.
pub struct PresenceRoom {
    local: PresenceRecord,
    local_active: bool,
    clock: u64,
    /// Remote peers with the clock of their latest accepted message.
    peers: HashMap<Uuid, (u64, PresenceRecord)>,
    /// Clock at which a peer left, so reordered older states stay dropped.
    departed: HashMap<Uuid, u64>,
    last_broadcast: Option<Instant>,
    throttle: Duration,
    /// A throttled cursor move is waiting for `flush`.
    pending: bool,
    changes: Emitter<Vec<PresenceRecord>>,
}

impl PresenceRoom {
    pub fn new(local: PresenceRecord) -> Self {
        Self::with_throttle(local, CURSOR_THROTTLE)
    }

    pub fn with_throttle(local: PresenceRecord, throttle: Duration) -> Self {
        Self {
            local,
            local_active: false,
            clock: 0,
            peers: HashMap::new(),
            departed: HashMap::new(),
            last_broadcast: None,
            throttle,
            pending: false,
            changes: Emitter::new(),
        }
    }

    pub fn local_peer_id(&self) -> Uuid {
        self.local.peer_id
    }

    pub fn local_record(&self) -> &PresenceRecord {
        &self.local
    }

    /// Receiver of the full participant list, sent on every change.
    pub fn on_presence_change(&self) -> Receiver<Vec<PresenceRecord>> {
        self.changes.subscribe()
    }

    /// Merge `update` into the local record.
    ///
    /// Returns the message to publish, or `None` when nothing changed or a
    /// cursor-only move was throttled (see [`PresenceRoom::flush`]).
    pub fn set_local_presence(&mut self, update: PresenceUpdate) -> Option<AwarenessMessage> {
        let cursor_only = update.is_cursor_only();
        let changed = update.merge_into(&mut self.local);
        let activated = !self.local_active;
        self.local_active = true;
        if !changed && !activated {
            return None;
        }
        self.notify();

        let throttled = self
            .last_broadcast
            .is_some_and(|at| at.elapsed() < self.throttle);
        if cursor_only && throttled && !activated {
            self.pending = true;
            return None;
        }
        Some(self.stamp())
    }

    /// Publish a throttled cursor move, if one is waiting.
    pub fn flush(&mut self) -> Option<AwarenessMessage> {
        if !self.pending || !self.local_active {
            return None;
        }
        Some(self.stamp())
    }

    /// Current local state, e.g. to re-announce after a reconnect.
    pub fn announce(&mut self) -> Option<AwarenessMessage> {
        if !self.local_active {
            return None;
        }
        Some(self.stamp())
    }

    fn stamp(&mut self) -> AwarenessMessage {
        self.clock += 1;
        self.pending = false;
        self.last_broadcast = Some(Instant::now());
        AwarenessMessage::State {
            clock: self.clock,
            record: self.local.clone(),
        }
    }

    /// Remove the local record. Returns the leave message to publish.
    pub fn clear_local_presence(&mut self) -> AwarenessMessage {
        self.local_active = false;
        self.pending = false;
        self.local.cursor = None;
        self.local.typing = None;
        self.local.dragging = None;
        self.clock += 1;
        self.notify();
        AwarenessMessage::Leave {
            peer_id: self.local.peer_id,
            clock: self.clock,
        }
    }

    /// Apply a message from a peer. Returns whether the participant set changed.
    pub fn handle_message(&mut self, msg: &AwarenessMessage) -> bool {
        let peer_id = msg.peer_id();
        if peer_id == self.local.peer_id {
            return false;
        }
        let clock = msg.clock();
        let known = self
            .peers
            .get(&peer_id)
            .map(|(c, _)| *c)
            .or_else(|| self.departed.get(&peer_id).copied());
        if known.is_some_and(|k| clock <= k) {
            log::trace!("Dropping stale presence from {peer_id} (clock {clock})");
            return false;
        }

        match msg {
            AwarenessMessage::State { record, .. } => {
                self.departed.remove(&peer_id);
                self.peers.insert(peer_id, (clock, record.clone()));
            }
            AwarenessMessage::Leave { .. } => {
                self.peers.remove(&peer_id);
                self.departed.insert(peer_id, clock);
            }
        }
        self.notify();
        true
    }

    /// Drop a peer the server reported as disconnected.
    pub fn remove_peer(&mut self, peer_id: &Uuid) -> bool {
        match self.peers.remove(peer_id) {
            Some((clock, _)) => {
                self.departed.insert(*peer_id, clock);
                self.notify();
                true
            }
            None => false,
        }
    }

    /// Every participant: the local one first (when active), then remote
    /// peers ordered by peer id.
    pub fn participants(&self) -> Vec<PresenceRecord> {
        let mut remote: Vec<&PresenceRecord> = self.peers.values().map(|(_, r)| r).collect();
        remote.sort_by_key(|r| r.peer_id);

        let mut all = Vec::with_capacity(remote.len() + 1);
        if self.local_active {
            all.push(self.local.clone());
        }
        all.extend(remote.into_iter().cloned());
        all
    }

    pub fn peer(&self, peer_id: &Uuid) -> Option<&PresenceRecord> {
        self.peers.get(peer_id).map(|(_, r)| r)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn notify(&self) {
        self.changes.emit(self.participants());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn room(name: &str, throttle: Duration) -> PresenceRoom {
        PresenceRoom::with_throttle(PresenceRecord::new(Uuid::new_v4(), Uuid::new_v4(), name), throttle)
    }

    #[test]
    fn test_color_is_stable() {
        let id = Uuid::new_v4();
        assert_eq!(CursorColor::from_uuid(id), CursorColor::from_uuid(id));
        let c = CursorColor::from_uuid(id);
        for v in c.to_array() {
            assert!((0.0..=1.0).contains(&v));
        }
    }

    #[test]
    fn test_first_update_always_published() {
        let mut alice = room("Alice", Duration::from_secs(60));
        let msg = alice.set_local_presence(PresenceUpdate::cursor(Point::new(1.0, 2.0)));
        assert!(matches!(msg, Some(AwarenessMessage::State { clock: 1, .. })));
    }

    #[test]
    fn test_cursor_moves_are_throttled_then_flushed() {
        let mut alice = room("Alice", Duration::from_secs(60));
        alice.set_local_presence(PresenceUpdate::cursor(Point::new(0.0, 0.0)));

        assert!(alice.set_local_presence(PresenceUpdate::cursor(Point::new(5.0, 5.0))).is_none());
        assert!(alice.set_local_presence(PresenceUpdate::cursor(Point::new(9.0, 9.0))).is_none());

        match alice.flush() {
            Some(AwarenessMessage::State { record, .. }) => {
                assert_eq!(record.cursor, Some(Point::new(9.0, 9.0)));
            }
            other => panic!("expected state, got {other:?}"),
        }
        assert!(alice.flush().is_none());
    }

    #[test]
    fn test_non_cursor_updates_bypass_throttle() {
        let mut alice = room("Alice", Duration::from_secs(60));
        alice.set_local_presence(PresenceUpdate::cursor(Point::new(0.0, 0.0)));
        let msg = alice.set_local_presence(PresenceUpdate::typing("b1", 4));
        assert!(msg.is_some());
    }

    #[test]
    fn test_throttle_window_expires() {
        let mut alice = room("Alice", Duration::from_millis(5));
        alice.set_local_presence(PresenceUpdate::cursor(Point::new(0.0, 0.0)));
        thread::sleep(Duration::from_millis(15));
        assert!(alice.set_local_presence(PresenceUpdate::cursor(Point::new(1.0, 0.0))).is_some());
    }

    #[test]
    fn test_remote_state_and_stale_clock() {
        let mut alice = room("Alice", CURSOR_THROTTLE);
        let mut bob = room("Bob", Duration::ZERO);

        let first = bob.set_local_presence(PresenceUpdate::cursor(Point::new(1.0, 1.0))).unwrap();
        let second = bob.set_local_presence(PresenceUpdate::dragging("b7")).unwrap();

        assert!(alice.handle_message(&second));
        // Reordered older message is ignored.
        assert!(!alice.handle_message(&first));

        let peer = alice.peer(&bob.local_peer_id()).unwrap();
        assert_eq!(peer.dragging.as_deref(), Some("b7"));
    }

    #[test]
    fn test_leave_removes_and_blocks_older_states() {
        let mut alice = room("Alice", CURSOR_THROTTLE);
        let mut bob = room("Bob", Duration::ZERO);

        let state = bob.set_local_presence(PresenceUpdate::cursor(Point::new(1.0, 1.0))).unwrap();
        alice.handle_message(&state);
        let leave = bob.clear_local_presence();
        assert!(alice.handle_message(&leave));
        assert_eq!(alice.peer_count(), 0);
        assert!(!alice.handle_message(&state));

        // A fresh state after the leave is accepted again.
        let back = bob.set_local_presence(PresenceUpdate::cursor(Point::new(2.0, 2.0))).unwrap();
        assert!(alice.handle_message(&back));
    }

    #[test]
    fn test_own_messages_ignored() {
        let mut alice = room("Alice", CURSOR_THROTTLE);
        let msg = alice.set_local_presence(PresenceUpdate::cursor(Point::new(1.0, 1.0))).unwrap();
        assert!(!alice.handle_message(&msg));
        assert_eq!(alice.peer_count(), 0);
    }

    #[test]
    fn test_change_callback_receives_full_set() {
        let mut alice = room("Alice", CURSOR_THROTTLE);
        let mut bob = room("Bob", Duration::ZERO);
        let changes = alice.on_presence_change();

        alice.set_local_presence(PresenceUpdate::cursor(Point::new(0.0, 0.0)));
        assert_eq!(changes.try_recv().unwrap().len(), 1);

        let msg = bob.set_local_presence(PresenceUpdate::typing("b1", 0)).unwrap();
        alice.handle_message(&msg);
        let set = changes.try_recv().unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set[0].peer_id, alice.local_peer_id());

        alice.remove_peer(&bob.local_peer_id());
        assert_eq!(changes.try_recv().unwrap().len(), 1);
    }

    #[test]
    fn test_awareness_message_roundtrip() {
        let record = PresenceRecord::new(Uuid::new_v4(), Uuid::new_v4(), "Carol");
        let msg = AwarenessMessage::State { clock: 9, record };
        let decoded = AwarenessMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.clock(), 9);
    }
}
