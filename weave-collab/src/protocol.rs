//! Binary protocol for canvas synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬────────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ project_id │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes   │ varint   │ variable │
//! └──────────┴───────────┴────────────┴──────────┴──────────┘
//! ```
//!
//! `SyncStep1` carries a yrs state vector, `SyncStep2` and `Delta` carry yrs
//! v1 updates. `Awareness`, `PeerJoined` and `Signal` carry bincode-encoded
//! structured payloads.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Close code sent when a user's access to a project is revoked.
pub const CLOSE_ACCESS_REVOKED: u16 = 4403;

/// Close reason paired with [`CLOSE_ACCESS_REVOKED`].
pub const CLOSE_ACCESS_REVOKED_REASON: &str = "access revoked";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// State vector, asking the receiver for what the sender is missing.
    SyncStep1 = 1,
    /// Update answering a `SyncStep1`, or the full state on join.
    SyncStep2 = 2,
    /// Incremental update.
    Delta = 3,
    /// Presence message.
    Awareness = 4,
    /// Join handshake (client → server) and join notice (server → peers).
    PeerJoined = 5,
    PeerLeft = 6,
    Ping = 7,
    Pong = 8,
    /// Ephemeral project signal on the lobby channel.
    Signal = 9,
    /// The document was replaced wholesale; receivers drop their undo history.
    Replaced = 10,
}

/// Peer identity announced in the join handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    /// Authenticated user behind the connection. Filled in by the server.
    pub user_id: Option<Uuid>,
    pub name: String,
    /// RGBA color for cursor rendering.
    pub color: [f32; 4],
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create with explicit peer_id (for testing)
    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        // Stable color from the peer id.
        let hash = peer_id.as_u128();
        let r = (hash & 0xFF) as f32 / 255.0;
        let g = ((hash >> 8) & 0xFF) as f32 / 255.0;
        let b = ((hash >> 16) & 0xFF) as f32 / 255.0;
        Self {
            peer_id,
            user_id: None,
            name: name.into(),
            color: [r, g, b, 1.0],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub doc_id: Uuid,
    /// Sender-local logical clock. Only awareness messages rely on it.
    pub clock: u64,
    pub payload: Vec<u8>,
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

impl SyncMessage {
    fn raw(msg_type: MessageType, peer_id: Uuid, doc_id: Uuid, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            doc_id,
            clock,
            payload,
        }
    }

    pub fn delta(peer_id: Uuid, doc_id: Uuid, clock: u64, yrs_update: Vec<u8>) -> Self {
        Self::raw(MessageType::Delta, peer_id, doc_id, clock, yrs_update)
    }

    pub fn sync_step1(peer_id: Uuid, doc_id: Uuid, state_vector: Vec<u8>) -> Self {
        Self::raw(MessageType::SyncStep1, peer_id, doc_id, 0, state_vector)
    }

    pub fn sync_step2(peer_id: Uuid, doc_id: Uuid, state_diff: Vec<u8>) -> Self {
        Self::raw(MessageType::SyncStep2, peer_id, doc_id, 0, state_diff)
    }

    /// Wrap an already-encoded presence message.
    pub fn awareness(peer_id: Uuid, doc_id: Uuid, clock: u64, presence: Vec<u8>) -> Self {
        Self::raw(MessageType::Awareness, peer_id, doc_id, clock, presence)
    }

    pub fn peer_joined(doc_id: Uuid, info: &PeerInfo) -> Result<Self, ProtocolError> {
        Ok(Self::raw(
            MessageType::PeerJoined,
            info.peer_id,
            doc_id,
            0,
            encode_payload(info)?,
        ))
    }

    pub fn peer_left(peer_id: Uuid, doc_id: Uuid) -> Self {
        Self::raw(MessageType::PeerLeft, peer_id, doc_id, 0, Vec::new())
    }

    pub fn signal<T: Serialize>(doc_id: Uuid, signal: &T) -> Result<Self, ProtocolError> {
        Ok(Self::raw(
            MessageType::Signal,
            Uuid::nil(),
            doc_id,
            0,
            encode_payload(signal)?,
        ))
    }

    pub fn replaced(doc_id: Uuid) -> Self {
        Self::raw(MessageType::Replaced, Uuid::nil(), doc_id, 0, Vec::new())
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::raw(MessageType::Ping, peer_id, Uuid::nil(), 0, Vec::new())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::raw(MessageType::Pong, peer_id, Uuid::nil(), 0, Vec::new())
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_payload(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Decode a structured payload.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let (value, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(value)
    }

    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        if self.msg_type != MessageType::PeerJoined {
            return Err(ProtocolError::InvalidMessageType);
        }
        self.payload_as()
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("invalid message type")]
    InvalidMessageType,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection timeout")]
    Timeout,
}
