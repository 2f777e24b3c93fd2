//! Client-facing events — what a connected peer sends and receives.
//!
//! One JSON object per line. Requests carry a client-chosen `request_id`
//! that comes back on the matching `reply`. Everything else the server
//! pushes is a peer event for a session the connection takes part in.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::envelope::hex_bytes;
use crate::error::{FailureReason, RelayError};
use crate::session::SessionId;

/// A request from a connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub request_id: u64,
    #[serde(flatten)]
    pub event: ClientEvent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ClientEvent {
    #[serde(rename = "session.open")]
    Open {
        declared_size: i64,
        #[serde(default)]
        file_name: Option<String>,
    },

    #[serde(rename = "session.join")]
    Join { session_id: SessionId },

    #[serde(rename = "chunk.send")]
    ChunkSend {
        session_id: SessionId,
        sequence: u64,
        #[serde(with = "hex_bytes")]
        payload: Bytes,
    },

    #[serde(rename = "chunk.ack")]
    ChunkAck { session_id: SessionId, sequence: u64 },

    #[serde(rename = "session.finish")]
    Finish { session_id: SessionId },

    #[serde(rename = "session.complete")]
    Complete { session_id: SessionId },

    #[serde(rename = "session.cancel")]
    Cancel {
        session_id: SessionId,
        #[serde(default)]
        reason: Option<String>,
    },
}

/// Error detail on a failed reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub status: u16,
    pub message: String,
}

impl From<&RelayError> for ErrorBody {
    fn from(e: &RelayError) -> Self {
        Self {
            code: e.code().to_string(),
            status: e.status(),
            message: e.to_string(),
        }
    }
}

/// Everything the server sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ServerEvent {
    #[serde(rename = "reply")]
    Reply {
        request_id: u64,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },

    #[serde(rename = "peer.joined")]
    PeerJoined { session_id: SessionId },

    #[serde(rename = "chunk.receive")]
    ChunkReceive {
        session_id: SessionId,
        sequence: u64,
        #[serde(with = "hex_bytes")]
        payload: Bytes,
    },

    #[serde(rename = "chunk.acked")]
    ChunkAcked { session_id: SessionId, sequence: u64 },

    #[serde(rename = "session.finished")]
    Finished {
        session_id: SessionId,
        bytes_relayed: u64,
    },

    #[serde(rename = "session.completed")]
    Completed { session_id: SessionId },

    #[serde(rename = "session.cancelled")]
    Cancelled { session_id: SessionId, reason: String },

    #[serde(rename = "session.failed")]
    Failed {
        session_id: SessionId,
        reason: FailureReason,
    },
}

impl ServerEvent {
    pub fn ok<T: Serialize>(request_id: u64, data: &T) -> Self {
        ServerEvent::Reply {
            request_id,
            ok: true,
            data: serde_json::to_value(data).ok(),
            error: None,
        }
    }

    pub fn error(request_id: u64, err: &RelayError) -> Self {
        ServerEvent::Reply {
            request_id,
            ok: false,
            data: None,
            error: Some(ErrorBody::from(err)),
        }
    }

    /// Reply to a line that did not parse as a request.
    pub fn malformed(message: impl Into<String>) -> Self {
        ServerEvent::Reply {
            request_id: 0,
            ok: false,
            data: None,
            error: Some(ErrorBody {
                code: "malformed".to_string(),
                status: 422,
                message: message.into(),
            }),
        }
    }
}
