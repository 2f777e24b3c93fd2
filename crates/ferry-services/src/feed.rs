//! Peer feed — what one peer's connection hears about its session.
//!
//! A feed merges the session's control and data channels, drops
//! redeliveries, skips events the peer caused itself, and ends after the
//! first terminal event. On the sender side it also hands acknowledged
//! credits back to the session's credit window.

use std::sync::Arc;

use bytes::Bytes;
use tokio_stream::StreamExt;

use ferry_core::wire::ServerEvent;
use ferry_core::{ControlEvent, Envelope, EnvelopeBody, FailureReason, Role, SessionId};

use crate::flow::CreditWindow;
use crate::ledger::{Delivery, DeliveryLedger};
use crate::mediator::Subscription;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    PeerJoined,
    Chunk { sequence: u64, payload: Bytes },
    ChunkAcked { sequence: u64 },
    EndOfStream { bytes_relayed: u64 },
    Completed,
    Cancelled { reason: String },
    Failed { reason: FailureReason },
}

impl PeerEvent {
    pub fn into_server_event(self, session_id: SessionId) -> ServerEvent {
        match self {
            PeerEvent::PeerJoined => ServerEvent::PeerJoined { session_id },
            PeerEvent::Chunk { sequence, payload } => ServerEvent::ChunkReceive {
                session_id,
                sequence,
                payload,
            },
            PeerEvent::ChunkAcked { sequence } => ServerEvent::ChunkAcked {
                session_id,
                sequence,
            },
            PeerEvent::EndOfStream { bytes_relayed } => ServerEvent::Finished {
                session_id,
                bytes_relayed,
            },
            PeerEvent::Completed => ServerEvent::Completed { session_id },
            PeerEvent::Cancelled { reason } => ServerEvent::Cancelled { session_id, reason },
            PeerEvent::Failed { reason } => ServerEvent::Failed { session_id, reason },
        }
    }
}

impl From<ControlEvent> for PeerEvent {
    fn from(event: ControlEvent) -> Self {
        match event {
            ControlEvent::PeerJoined { .. } => PeerEvent::PeerJoined,
            ControlEvent::EndOfStream { bytes_relayed } => PeerEvent::EndOfStream { bytes_relayed },
            ControlEvent::Completed => PeerEvent::Completed,
            ControlEvent::Cancelled { reason } => PeerEvent::Cancelled { reason },
            ControlEvent::Failed { reason } => PeerEvent::Failed { reason },
        }
    }
}

pub struct PeerFeed {
    session_id: SessionId,
    role: Role,
    control: Subscription,
    data: Option<Subscription>,
    window: Option<Arc<CreditWindow>>,
    ledger: DeliveryLedger,
    finished: bool,
}

impl PeerFeed {
    pub fn new(
        session_id: SessionId,
        role: Role,
        control: Subscription,
        data: Option<Subscription>,
        window: Option<Arc<CreditWindow>>,
    ) -> Self {
        Self {
            session_id,
            role,
            control,
            data,
            window,
            ledger: DeliveryLedger::new(),
            finished: false,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Next event for this peer. `None` once the session has ended or the
    /// mediator closed both channels.
    pub async fn next(&mut self) -> Option<PeerEvent> {
        while !self.finished {
            let envelope = self.recv().await?;
            if let Some(event) = self.accept(envelope) {
                return Some(event);
            }
        }
        None
    }

    async fn recv(&mut self) -> Option<Envelope> {
        match self.data.as_mut() {
            // Data first: every chunk is on the data channel before the
            // EndOfStream that follows it is published.
            Some(data) => tokio::select! {
                biased;
                Some(envelope) = data.next() => Some(envelope),
                Some(envelope) = self.control.next() => Some(envelope),
                else => None,
            },
            None => self.control.next().await,
        }
    }

    fn accept(&mut self, envelope: Envelope) -> Option<PeerEvent> {
        if envelope.session_id != self.session_id {
            return None;
        }
        let own = envelope.origin == Some(self.role);

        match envelope.body {
            EnvelopeBody::Chunk { sequence, payload } => {
                if own {
                    return None;
                }
                match self.ledger.chunk(sequence) {
                    Delivery::Duplicate => {
                        tracing::debug!(session_id = %self.session_id, sequence, "duplicate chunk dropped");
                        None
                    }
                    Delivery::Gap { expected } => {
                        tracing::warn!(
                            session_id = %self.session_id,
                            expected,
                            got = sequence,
                            "chunk gap on data channel"
                        );
                        Some(PeerEvent::Chunk { sequence, payload })
                    }
                    Delivery::Fresh => Some(PeerEvent::Chunk { sequence, payload }),
                }
            }

            EnvelopeBody::Ack { sequence } => {
                if own || self.ledger.ack(sequence) == Delivery::Duplicate {
                    return None;
                }
                if let Some(window) = &self.window {
                    let returned = window.release_through(sequence);
                    tracing::debug!(session_id = %self.session_id, sequence, returned, "credits released");
                }
                Some(PeerEvent::ChunkAcked { sequence })
            }

            EnvelopeBody::Control { version, event } => {
                if self.ledger.control(version) == Delivery::Duplicate {
                    tracing::debug!(session_id = %self.session_id, version, "duplicate control event dropped");
                    return None;
                }
                if let Some(state) = event.terminal_state() {
                    self.finished = true;
                    if let Some(window) = &self.window {
                        window.close(state);
                    }
                }
                if own {
                    return None;
                }
                Some(PeerEvent::from(event))
            }
        }
    }
}
