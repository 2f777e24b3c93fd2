//! ferry-core — session model, envelopes, wire events, and configuration.
//! All other Ferry crates depend on this one.

pub mod config;
pub mod envelope;
pub mod error;
pub mod session;
pub mod transfer;
pub mod wire;

pub use envelope::{ControlEvent, Envelope, EnvelopeBody};
pub use error::{FailureReason, RelayError};
pub use session::{ConnectionId, InstanceId, PeerHandle, Role, SessionId, SessionState};
pub use transfer::{ChunkReceipt, SessionStatus, TransferSession, Versioned};
