//! Session identity — ids, roles, peer handles, and lifecycle states.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

// ── Session ID ────────────────────────────────────────────────────────────────

/// Opaque session identifier: 256 random bits as lowercase hex.
///
/// Addressing key for every registry record and mediator channel
/// belonging to one transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh, externally unguessable id.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Channel for join/finish/complete/cancel/fail events and acks.
    pub fn control_channel(&self) -> String {
        format!("session.{}.control", self.0)
    }

    /// Channel for chunk payloads.
    pub fn data_channel(&self) -> String {
        format!("session.{}.data", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ── Roles ─────────────────────────────────────────────────────────────────────

/// The two peer positions in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Sender,
    Receiver,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sender => f.write_str("sender"),
            Role::Receiver => f.write_str("receiver"),
        }
    }
}

// ── Peer handles ──────────────────────────────────────────────────────────────

/// Transport-assigned connection key. The coordinator only ever looks
/// connections up by this key; it never owns one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Name of the server process a connection is attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    /// Random instance name, used when none is configured.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(format!("ferry-{}", hex::encode(bytes)))
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One connected participant: which connection, on which instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerHandle {
    pub connection: ConnectionId,
    pub instance: InstanceId,
}

impl PeerHandle {
    pub fn new(connection: ConnectionId, instance: InstanceId) -> Self {
        Self {
            connection,
            instance,
        }
    }
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.connection, self.instance)
    }
}

// ── Lifecycle ─────────────────────────────────────────────────────────────────

/// Session lifecycle.
///
/// Forward path: Created → AwaitingPeer → Active → Completing → Completed.
/// Cancelled and Failed are reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    AwaitingPeer,
    Active,
    Completing,
    Completed,
    Cancelled,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Cancelled | SessionState::Failed
        )
    }

    fn rank(self) -> u8 {
        match self {
            SessionState::Created => 0,
            SessionState::AwaitingPeer => 1,
            SessionState::Active => 2,
            SessionState::Completing => 3,
            SessionState::Completed | SessionState::Cancelled | SessionState::Failed => 4,
        }
    }

    /// Whether `next` is a legal successor. Forward steps are exactly one
    /// rank; the two abort states are open to anything not yet terminal.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            SessionState::Cancelled | SessionState::Failed => true,
            SessionState::Created => false,
            _ => next.rank() == self.rank() + 1,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Created => "created",
            SessionState::AwaitingPeer => "awaiting_peer",
            SessionState::Active => "active",
            SessionState::Completing => "completing",
            SessionState::Completed => "completed",
            SessionState::Cancelled => "cancelled",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [SessionState; 7] = [
        SessionState::Created,
        SessionState::AwaitingPeer,
        SessionState::Active,
        SessionState::Completing,
        SessionState::Completed,
        SessionState::Cancelled,
        SessionState::Failed,
    ];

    #[test]
    fn generated_ids_are_unique_hex() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert!(a.as_str().bytes().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn channels_are_keyed_by_session() {
        let id = SessionId::from("abc");
        assert_eq!(id.control_channel(), "session.abc.control");
        assert_eq!(id.data_channel(), "session.abc.data");
    }

    #[test]
    fn forward_path_is_single_step() {
        use SessionState::*;
        assert!(Created.can_transition_to(AwaitingPeer));
        assert!(AwaitingPeer.can_transition_to(Active));
        assert!(Active.can_transition_to(Completing));
        assert!(Completing.can_transition_to(Completed));

        assert!(!Created.can_transition_to(Active));
        assert!(!AwaitingPeer.can_transition_to(Completing));
        assert!(!Active.can_transition_to(Completed));
        assert!(!Active.can_transition_to(AwaitingPeer));
    }

    #[test]
    fn terminal_states_are_final() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} allowed");
            }
        }
    }

    #[test]
    fn abort_states_reachable_from_any_live_state() {
        for from in ALL.iter().filter(|s| !s.is_terminal()) {
            assert!(from.can_transition_to(SessionState::Cancelled));
            assert!(from.can_transition_to(SessionState::Failed));
        }
    }

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Receiver).unwrap(), "\"receiver\"");
    }
}
