//! Mediator envelopes — what travels between instances on a session's
//! control and data channels.
//!
//! De-duplication keys:
//!   Control — the registry version that committed the event
//!   Chunk   — the chunk sequence number
//!   Ack     — cumulative, highest sequence wins

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::FailureReason;
use crate::session::{PeerHandle, Role, SessionId, SessionState};

/// One message on a session channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub session_id: SessionId,
    /// Which peer's action produced this. `None` for coordinator-initiated
    /// events such as an idle timeout.
    pub origin: Option<Role>,
    pub body: EnvelopeBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EnvelopeBody {
    Control {
        version: u64,
        event: ControlEvent,
    },
    Chunk {
        sequence: u64,
        #[serde(with = "hex_bytes")]
        payload: Bytes,
    },
    Ack {
        sequence: u64,
    },
}

/// Lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControlEvent {
    PeerJoined { receiver: PeerHandle },
    EndOfStream { bytes_relayed: u64 },
    Completed,
    Cancelled { reason: String },
    Failed { reason: FailureReason },
}

impl ControlEvent {
    /// The state this event ends the session in, if it ends it.
    pub fn terminal_state(&self) -> Option<SessionState> {
        match self {
            ControlEvent::Completed => Some(SessionState::Completed),
            ControlEvent::Cancelled { .. } => Some(SessionState::Cancelled),
            ControlEvent::Failed { .. } => Some(SessionState::Failed),
            ControlEvent::PeerJoined { .. } | ControlEvent::EndOfStream { .. } => None,
        }
    }
}

impl Envelope {
    pub fn control(
        session_id: SessionId,
        origin: Option<Role>,
        version: u64,
        event: ControlEvent,
    ) -> Self {
        Self {
            session_id,
            origin,
            body: EnvelopeBody::Control { version, event },
        }
    }

    pub fn chunk(session_id: SessionId, sequence: u64, payload: Bytes) -> Self {
        Self {
            session_id,
            origin: Some(Role::Sender),
            body: EnvelopeBody::Chunk { sequence, payload },
        }
    }

    pub fn ack(session_id: SessionId, sequence: u64) -> Self {
        Self {
            session_id,
            origin: Some(Role::Receiver),
            body: EnvelopeBody::Ack { sequence },
        }
    }

    /// Channel this envelope belongs on.
    pub fn channel(&self) -> String {
        match self.body {
            EnvelopeBody::Chunk { .. } => self.session_id.data_channel(),
            _ => self.session_id.control_channel(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Serialize payload bytes as a hex string.
pub mod hex_bytes {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        Ok(Bytes::from(bytes))
    }
}
