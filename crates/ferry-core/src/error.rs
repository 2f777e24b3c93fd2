//! Error taxonomy for session operations.
//!
//! `RelayError` is what a caller sees. `FailureReason` is what gets
//! recorded on a Failed session and broadcast to the other peer.

use serde::{Deserialize, Serialize};

use crate::session::{Role, SessionId, SessionState};

/// Why a session ended in Failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("expected chunk {expected}, got {got}")]
    SequenceMismatch { expected: u64, got: u64 },

    #[error("declared {declared} bytes, relayed {relayed}")]
    ByteCountMismatch { declared: u64, relayed: u64 },

    #[error("{role} attempted an operation reserved for the other role")]
    RoleConflict { role: Role },

    #[error("finish requested before a receiver joined")]
    PrematureFinish,

    #[error("no activity within the idle window")]
    Timeout,

    #[error("mediator unavailable")]
    MediatorUnavailable,
}

/// Errors returned by coordinator operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("declared size must be positive, got {0}")]
    InvalidSize(i64),

    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error("{0} slot already occupied")]
    RoleOccupied(Role),

    #[error("session {0} expired")]
    SessionExpired(SessionId),

    #[error("expected chunk {expected}, got {got}")]
    SequenceMismatch { expected: u64, got: u64 },

    #[error("declared {declared} bytes, relayed {relayed}")]
    ByteCountMismatch { declared: u64, relayed: u64 },

    #[error("{0} attempted an operation reserved for the other role")]
    RoleConflict(Role),

    #[error("{operation} not allowed in state {state}")]
    InvalidState {
        state: SessionState,
        operation: &'static str,
    },

    #[error("session already {0}")]
    SessionTerminated(SessionState),

    #[error("caller is not a participant of this session")]
    NotParticipant,

    /// Lost an optimistic write. Recovered internally by re-reading.
    #[error("registry record changed underneath the write")]
    StaleWrite,

    #[error("gave up after {attempts} conflicting writes")]
    Contended { attempts: u32 },

    #[error("no activity within the idle window")]
    Timeout,

    #[error("mediator unavailable: {0}")]
    MediatorUnavailable(String),

    #[error("registry store error: {0}")]
    Store(String),
}

impl RelayError {
    /// Machine-readable error code for the wire.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::InvalidSize(_) => "invalid_size",
            RelayError::SessionNotFound(_) => "session_not_found",
            RelayError::RoleOccupied(_) => "role_occupied",
            RelayError::SessionExpired(_) => "session_expired",
            RelayError::SequenceMismatch { .. } => "sequence_mismatch",
            RelayError::ByteCountMismatch { .. } => "byte_count_mismatch",
            RelayError::RoleConflict(_) => "role_conflict",
            RelayError::InvalidState { .. } => "invalid_state",
            RelayError::SessionTerminated(_) => "session_terminated",
            RelayError::NotParticipant => "not_participant",
            RelayError::StaleWrite => "stale_write",
            RelayError::Contended { .. } => "contended",
            RelayError::Timeout => "timeout",
            RelayError::MediatorUnavailable(_) => "mediator_unavailable",
            RelayError::Store(_) => "store_error",
        }
    }

    /// HTTP-style status, the same numbers the browser client already
    /// understands from ack codes.
    pub fn status(&self) -> u16 {
        match self {
            RelayError::SessionNotFound(_) => 404,
            RelayError::InvalidSize(_) => 422,
            RelayError::RoleOccupied(_)
            | RelayError::RoleConflict(_)
            | RelayError::StaleWrite
            | RelayError::Contended { .. } => 409,
            RelayError::NotParticipant => 403,
            RelayError::SessionExpired(_) | RelayError::SessionTerminated(_) => 410,
            RelayError::SequenceMismatch { .. }
            | RelayError::ByteCountMismatch { .. }
            | RelayError::InvalidState { .. } => 400,
            RelayError::Timeout => 408,
            RelayError::MediatorUnavailable(_) | RelayError::Store(_) => 503,
        }
    }
}

impl From<FailureReason> for RelayError {
    fn from(reason: FailureReason) -> Self {
        match reason {
            FailureReason::SequenceMismatch { expected, got } => {
                RelayError::SequenceMismatch { expected, got }
            }
            FailureReason::ByteCountMismatch { declared, relayed } => {
                RelayError::ByteCountMismatch { declared, relayed }
            }
            FailureReason::RoleConflict { role } => RelayError::RoleConflict(role),
            FailureReason::PrematureFinish => RelayError::InvalidState {
                state: SessionState::AwaitingPeer,
                operation: "finish",
            },
            FailureReason::Timeout => RelayError::Timeout,
            FailureReason::MediatorUnavailable => {
                RelayError::MediatorUnavailable("retries exhausted".to_string())
            }
        }
    }
}
