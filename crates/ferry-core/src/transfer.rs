//! Transfer session — the per-transfer state machine.
//!
//! Every method here is pure: it validates one peer action against the
//! record and either mutates it or explains why not. Persisting the result
//! (compare-and-swap against the registry) and telling the other peer is
//! the coordinator's job.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{FailureReason, RelayError};
use crate::session::{PeerHandle, Role, SessionId, SessionState};

/// Milliseconds since the unix epoch. Record timestamps use wall-clock
/// millis because records are read by other processes.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A registry record plus the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub version: u64,
    pub record: T,
}

/// Canonical state of one transfer, as stored in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSession {
    pub id: SessionId,
    /// Name the sender announced at open time, if any.
    pub file_name: Option<String>,
    pub state: SessionState,
    pub sender: Option<PeerHandle>,
    pub receiver: Option<PeerHandle>,
    /// Next chunk sequence number accepted from the sender.
    pub sequence_expected: u64,
    pub bytes_relayed: u64,
    /// Fixed at open.
    pub declared_size: u64,
    pub created_at_ms: u64,
    pub last_activity_at_ms: u64,
    pub failure: Option<FailureReason>,
    pub cancel_reason: Option<String>,
}

/// Why a peer action was not applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refusal {
    /// Rejected; the record is untouched.
    Reject(RelayError),
    /// Protocol violation; the session must move to Failed.
    Violation(FailureReason),
}

impl From<RelayError> for Refusal {
    fn from(e: RelayError) -> Self {
        Refusal::Reject(e)
    }
}

/// Result of an accepted peer action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The record changed and must be written back.
    Applied,
    /// Nothing to do: the session is already terminal, or already past
    /// the requested point.
    Unchanged,
}

/// Snapshot returned to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: SessionId,
    pub state: SessionState,
    pub file_name: Option<String>,
    pub declared_size: u64,
    pub bytes_relayed: u64,
    pub sequence_expected: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
}

/// Acknowledgement of one accepted chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkReceipt {
    pub sequence: u64,
    pub bytes_relayed: u64,
}

impl TransferSession {
    /// Create a session owned by `sender` and move it straight to AwaitingPeer.
    pub fn open(
        id: SessionId,
        sender: PeerHandle,
        declared_size: i64,
        file_name: Option<String>,
        now_ms: u64,
    ) -> Result<Self, RelayError> {
        if declared_size <= 0 {
            return Err(RelayError::InvalidSize(declared_size));
        }
        let mut session = Self {
            id,
            file_name,
            state: SessionState::Created,
            sender: Some(sender),
            receiver: None,
            sequence_expected: 0,
            bytes_relayed: 0,
            declared_size: declared_size as u64,
            created_at_ms: now_ms,
            last_activity_at_ms: now_ms,
            failure: None,
            cancel_reason: None,
        };
        session.advance(SessionState::AwaitingPeer, now_ms)?;
        Ok(session)
    }

    fn advance(&mut self, next: SessionState, now_ms: u64) -> Result<(), RelayError> {
        if !self.state.can_transition_to(next) {
            return Err(RelayError::InvalidState {
                state: self.state,
                operation: "transition",
            });
        }
        self.state = next;
        self.last_activity_at_ms = now_ms;
        Ok(())
    }

    /// Which slot `peer` occupies, if any.
    pub fn role_of(&self, peer: &PeerHandle) -> Option<Role> {
        if self.sender.as_ref() == Some(peer) {
            Some(Role::Sender)
        } else if self.receiver.as_ref() == Some(peer) {
            Some(Role::Receiver)
        } else {
            None
        }
    }

    fn participant(&self, peer: &PeerHandle) -> Result<Role, Refusal> {
        self.role_of(peer)
            .ok_or(Refusal::Reject(RelayError::NotParticipant))
    }

    pub fn is_idle(&self, now_ms: u64, idle: Duration) -> bool {
        now_ms.saturating_sub(self.last_activity_at_ms) > idle.as_millis() as u64
    }

    /// Admit a peer into `role`. Only the receiver slot is ever free.
    pub fn admit(
        &mut self,
        peer: PeerHandle,
        role: Role,
        now_ms: u64,
        idle: Duration,
    ) -> Result<(), RelayError> {
        if self.state.is_terminal() || self.is_idle(now_ms, idle) {
            return Err(RelayError::SessionExpired(self.id.clone()));
        }
        let occupied = match role {
            Role::Sender => self.sender.is_some(),
            Role::Receiver => self.receiver.is_some(),
        };
        if occupied {
            return Err(RelayError::RoleOccupied(role));
        }
        if self.state != SessionState::AwaitingPeer {
            return Err(RelayError::InvalidState {
                state: self.state,
                operation: "join",
            });
        }
        self.receiver = Some(peer);
        self.advance(SessionState::Active, now_ms)
    }

    /// Validate and account one chunk from the sender.
    pub fn accept_chunk(
        &mut self,
        peer: &PeerHandle,
        sequence: u64,
        len: u64,
        now_ms: u64,
    ) -> Result<ChunkReceipt, Refusal> {
        let role = self.participant(peer)?;
        if self.state.is_terminal() {
            return Err(Refusal::Reject(RelayError::SessionTerminated(self.state)));
        }
        if role != Role::Sender {
            return Err(Refusal::Violation(FailureReason::RoleConflict { role }));
        }
        if self.state != SessionState::Active {
            return Err(Refusal::Reject(RelayError::InvalidState {
                state: self.state,
                operation: "relay_chunk",
            }));
        }
        if sequence != self.sequence_expected {
            return Err(Refusal::Violation(FailureReason::SequenceMismatch {
                expected: self.sequence_expected,
                got: sequence,
            }));
        }
        let relayed = self.bytes_relayed.saturating_add(len);
        if relayed > self.declared_size {
            return Err(Refusal::Violation(FailureReason::ByteCountMismatch {
                declared: self.declared_size,
                relayed,
            }));
        }
        self.sequence_expected += 1;
        self.bytes_relayed = relayed;
        self.last_activity_at_ms = now_ms;
        Ok(ChunkReceipt {
            sequence,
            bytes_relayed: relayed,
        })
    }

    /// Check a receiver acknowledgement. Acks never change the record.
    pub fn check_ack(&self, peer: &PeerHandle, sequence: u64) -> Result<Step, Refusal> {
        let role = self.participant(peer)?;
        if self.state.is_terminal() {
            return Ok(Step::Unchanged);
        }
        if role != Role::Receiver {
            return Err(Refusal::Violation(FailureReason::RoleConflict { role }));
        }
        if !matches!(self.state, SessionState::Active | SessionState::Completing) {
            return Err(Refusal::Reject(RelayError::InvalidState {
                state: self.state,
                operation: "acknowledge_chunk",
            }));
        }
        if sequence >= self.sequence_expected {
            return Err(Refusal::Violation(FailureReason::SequenceMismatch {
                expected: self.sequence_expected,
                got: sequence,
            }));
        }
        Ok(Step::Applied)
    }

    /// Sender signals end of stream.
    pub fn finish(&mut self, peer: &PeerHandle, now_ms: u64) -> Result<Step, Refusal> {
        let role = self.participant(peer)?;
        if self.state.is_terminal() || self.state == SessionState::Completing {
            return Ok(Step::Unchanged);
        }
        if role != Role::Sender {
            return Err(Refusal::Violation(FailureReason::RoleConflict { role }));
        }
        if self.state != SessionState::Active {
            return Err(Refusal::Violation(FailureReason::PrematureFinish));
        }
        if self.bytes_relayed != self.declared_size {
            return Err(Refusal::Violation(FailureReason::ByteCountMismatch {
                declared: self.declared_size,
                relayed: self.bytes_relayed,
            }));
        }
        self.advance(SessionState::Completing, now_ms)?;
        Ok(Step::Applied)
    }

    /// Receiver confirms it holds the whole file.
    pub fn complete(&mut self, peer: &PeerHandle, now_ms: u64) -> Result<Step, Refusal> {
        let role = self.participant(peer)?;
        if self.state.is_terminal() {
            return Ok(Step::Unchanged);
        }
        if role != Role::Receiver {
            return Err(Refusal::Violation(FailureReason::RoleConflict { role }));
        }
        if self.state != SessionState::Completing {
            return Err(Refusal::Reject(RelayError::InvalidState {
                state: self.state,
                operation: "complete_session",
            }));
        }
        self.advance(SessionState::Completed, now_ms)?;
        Ok(Step::Applied)
    }

    /// Either peer aborts.
    pub fn cancel(
        &mut self,
        peer: &PeerHandle,
        reason: &str,
        now_ms: u64,
    ) -> Result<(Role, Step), Refusal> {
        let role = self.participant(peer)?;
        if self.state.is_terminal() {
            return Ok((role, Step::Unchanged));
        }
        self.cancel_reason = Some(reason.to_string());
        self.advance(SessionState::Cancelled, now_ms)?;
        Ok((role, Step::Applied))
    }

    /// Move to Failed unless already terminal.
    pub fn fail(&mut self, reason: FailureReason, now_ms: u64) -> Step {
        if self.state.is_terminal() {
            return Step::Unchanged;
        }
        self.failure = Some(reason);
        self.state = SessionState::Failed;
        self.last_activity_at_ms = now_ms;
        Step::Applied
    }

    /// Fail with Timeout if still live and idle past the window.
    pub fn expire(&mut self, now_ms: u64, idle: Duration) -> Step {
        if self.state.is_terminal() || !self.is_idle(now_ms, idle) {
            return Step::Unchanged;
        }
        self.fail(FailureReason::Timeout, now_ms)
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.id.clone(),
            state: self.state,
            file_name: self.file_name.clone(),
            declared_size: self.declared_size,
            bytes_relayed: self.bytes_relayed,
            sequence_expected: self.sequence_expected,
            failure: self.failure.clone(),
            cancel_reason: self.cancel_reason.clone(),
        }
    }
}
