//! Binary protocol between sync clients and the server.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ client_id │ doc_id   │ sequence │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! `sequence` is the highest sequence number the message relates to
//! (the last op of a `Sequenced` batch, the document sequence in
//! `InitialState`), zero otherwise. Payloads are themselves bincode.
//! Sequenced operations travel as separately encoded blobs so a receiver
//! can drop one corrupt op without losing the batch.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::op::{ClientId, DocumentId, OutboundMutation};
use crate::presence::UserInfo;
use crate::summary::SummaryTree;
use crate::value::Value;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client asks to join a document room.
    Join = 1,
    /// Server reply to `Join`: summary, catch-up ops, users.
    InitialState = 2,
    /// Client submits local mutations for sequencing.
    SubmitOps = 3,
    /// Server broadcasts sequenced operations.
    Sequenced = 4,
    /// Ephemeral peer-to-peer data such as cursor positions.
    Signal = 5,
    PeerJoined = 6,
    PeerLeft = 7,
    Ping = 8,
    Pong = 9,
    /// Server refused the join (room full, unknown document).
    JoinRejected = 10,
}

/// Rejection reason prefix for a join whose client id still has a live
/// session. Clients retry these; the old session is usually on its way out.
pub const REJECT_DUPLICATE_CLIENT: &str = "duplicate client";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub user_name: String,
    /// Last sequence number the client applied, when rejoining.
    pub last_sequence: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialState {
    pub client_id: ClientId,
    pub user: UserInfo,
    /// Everyone in the room, the joining client included.
    pub connected_users: Vec<UserInfo>,
    /// Latest summary, omitted when the client can catch up from ops.
    pub summary: Option<SummaryTree>,
    pub summary_sequence: u64,
    /// Encoded operations after the summary (or after `last_sequence`).
    pub ops: Vec<Vec<u8>>,
    pub sequence_number: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub name: String,
    pub content: Value,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub client_id: Uuid,
    pub doc_id: Uuid,
    pub sequence: u64,
    pub payload: Vec<u8>,
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
    Ok(value)
}

impl SyncMessage {
    fn new(msg_type: MessageType, client_id: Uuid, doc_id: Uuid, sequence: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            client_id,
            doc_id,
            sequence,
            payload,
        }
    }

    /// `client_id` is the identity the client proposes for this session.
    pub fn join(client_id: ClientId, doc_id: DocumentId, request: &JoinRequest) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Join, client_id, doc_id, 0, encode_payload(request)?))
    }

    pub fn initial_state(doc_id: DocumentId, state: &InitialState) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            MessageType::InitialState,
            state.client_id,
            doc_id,
            state.sequence_number,
            encode_payload(state)?,
        ))
    }

    pub fn submit_ops(
        client_id: ClientId,
        doc_id: DocumentId,
        mutations: &[OutboundMutation],
    ) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::SubmitOps, client_id, doc_id, 0, encode_payload(&mutations)?))
    }

    /// A batch of sequenced operations, already encoded one by one.
    pub fn sequenced(doc_id: DocumentId, last_sequence: u64, ops: &[Vec<u8>]) -> Result<Self, ProtocolError> {
        Ok(Self::new(
            MessageType::Sequenced,
            Uuid::nil(),
            doc_id,
            last_sequence,
            encode_payload(&ops)?,
        ))
    }

    pub fn signal(client_id: ClientId, doc_id: DocumentId, signal: &SignalMessage) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Signal, client_id, doc_id, 0, encode_payload(signal)?))
    }

    pub fn peer_joined(doc_id: DocumentId, user: &UserInfo) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::PeerJoined, user.client_id, doc_id, 0, encode_payload(user)?))
    }

    pub fn peer_left(client_id: ClientId, doc_id: DocumentId) -> Self {
        Self::new(MessageType::PeerLeft, client_id, doc_id, 0, Vec::new())
    }

    pub fn join_rejected(doc_id: DocumentId, reason: &str) -> Self {
        Self::new(
            MessageType::JoinRejected,
            Uuid::nil(),
            doc_id,
            0,
            reason.as_bytes().to_vec(),
        )
    }

    pub fn ping(client_id: ClientId) -> Self {
        Self::new(MessageType::Ping, client_id, Uuid::nil(), 0, Vec::new())
    }

    pub fn pong(client_id: ClientId) -> Self {
        Self::new(MessageType::Pong, client_id, Uuid::nil(), 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_payload(self)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_payload(bytes)
    }

    fn expect(&self, msg_type: MessageType) -> Result<(), ProtocolError> {
        if self.msg_type != msg_type {
            return Err(ProtocolError::InvalidMessageType {
                expected: msg_type,
                actual: self.msg_type,
            });
        }
        Ok(())
    }

    pub fn join_request(&self) -> Result<JoinRequest, ProtocolError> {
        self.expect(MessageType::Join)?;
        decode_payload(&self.payload)
    }

    pub fn initial_state_payload(&self) -> Result<InitialState, ProtocolError> {
        self.expect(MessageType::InitialState)?;
        decode_payload(&self.payload)
    }

    pub fn submitted_ops(&self) -> Result<Vec<OutboundMutation>, ProtocolError> {
        self.expect(MessageType::SubmitOps)?;
        decode_payload(&self.payload)
    }

    pub fn sequenced_ops(&self) -> Result<Vec<Vec<u8>>, ProtocolError> {
        self.expect(MessageType::Sequenced)?;
        decode_payload(&self.payload)
    }

    pub fn signal_payload(&self) -> Result<SignalMessage, ProtocolError> {
        self.expect(MessageType::Signal)?;
        decode_payload(&self.payload)
    }

    pub fn user_info(&self) -> Result<UserInfo, ProtocolError> {
        self.expect(MessageType::PeerJoined)?;
        decode_payload(&self.payload)
    }

    pub fn rejection_reason(&self) -> Result<String, ProtocolError> {
        self.expect(MessageType::JoinRejected)?;
        Ok(String::from_utf8_lossy(&self.payload).into_owned())
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Invalid message type: expected {expected:?}, got {actual:?}")]
    InvalidMessageType {
        expected: MessageType,
        actual: MessageType,
    },
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}
