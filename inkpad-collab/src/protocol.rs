//! Binary protocol for page session synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬────────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ session_id │ page_id  │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes   │ 16 bytes │ 8 bytes  │ variable │
//! └──────────┴────────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Messages are scoped to one page's session. Payloads carry CRDT state
//! vectors and updates in their v1 binary encoding; the protocol itself
//! never inspects them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// First message of a session: join the page's document.
    Join = 1,
    /// State vector — "send me what I'm missing".
    SyncStep1 = 2,
    /// State diff response — the initial full-state transfer.
    SyncStep2 = 3,
    /// Incremental CRDT update.
    Delta = 4,
    /// Heartbeat ping.
    Ping = 5,
    /// Heartbeat pong.
    Pong = 6,
}

/// Session identity with display metadata for logs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub client_name: String,
}

impl SessionInfo {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            client_name: client_name.into(),
        }
    }

    /// Create with an explicit session id (for testing).
    pub fn with_id(session_id: Uuid, client_name: impl Into<String>) -> Self {
        Self {
            session_id,
            client_name: client_name.into(),
        }
    }
}

/// Top-level protocol message.
///
/// Serialized with bincode for minimal overhead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub session_id: Uuid,
    pub page_id: Uuid,
    /// Per-session clock, monotonically increasing over deltas.
    pub clock: u64,
    /// Message payload (varies by msg_type).
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// Create a join message opening a session on `page_id`.
    pub fn join(page_id: Uuid, info: &SessionInfo) -> Self {
        let payload = bincode::serde::encode_to_vec(info, bincode::config::standard())
            .unwrap_or_default();
        Self {
            msg_type: MessageType::Join,
            session_id: info.session_id,
            page_id,
            clock: 0,
            payload,
        }
    }

    /// Create a sync step 1 (state vector).
    pub fn sync_step1(session_id: Uuid, page_id: Uuid, state_vector: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep1,
            session_id,
            page_id,
            clock: 0,
            payload: state_vector,
        }
    }

    /// Create a sync step 2 (state diff response).
    pub fn sync_step2(session_id: Uuid, page_id: Uuid, state_diff: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SyncStep2,
            session_id,
            page_id,
            clock: 0,
            payload: state_diff,
        }
    }

    /// Create a delta update message.
    pub fn delta(session_id: Uuid, page_id: Uuid, clock: u64, update: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Delta,
            session_id,
            page_id,
            clock,
            payload: update,
        }
    }

    /// Create a ping message.
    pub fn ping(session_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Ping,
            session_id,
            page_id: Uuid::nil(),
            clock: 0,
            payload: Vec::new(),
        }
    }

    /// Create a pong message.
    pub fn pong(session_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Pong,
            session_id,
            page_id: Uuid::nil(),
            clock: 0,
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the session info carried by a join message.
    pub fn session_info(&self) -> Result<SessionInfo, ProtocolError> {
        if self.msg_type != MessageType::Join {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (info, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(info)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
