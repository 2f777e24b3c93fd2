//! Connection handler — one per client connection.
//!
//! Turns client requests into coordinator calls and forwards the peer
//! events of every session the connection takes part in to its outbound
//! queue. Replies go to the same queue and carry the request's
//! `request_id`. The transport owns the socket; the handler only sees
//! lines and events.
//!
//! Chunks and finish for a session this connection sends on run in order on
//! that session's lane. Everything else runs before the next line is read,
//! so a chunk waiting for credit never holds up a cancel or a disconnect.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use ferry_core::wire::{ClientEvent, ClientRequest, ServerEvent};
use ferry_core::{FailureReason, PeerHandle, RelayError, Role, SessionId};

use crate::coordinator::SessionCoordinator;
use crate::feed::PeerFeed;

/// Sender work that must keep its order within a session.
enum LaneOp {
    Chunk { sequence: u64, payload: Bytes },
    Finish,
}

struct Queued {
    request_id: u64,
    session_id: SessionId,
    op: LaneOp,
}

struct Lane {
    queue: mpsc::UnboundedSender<Queued>,
    worker: JoinHandle<()>,
}

/// A session this connection takes part in.
struct Attached {
    generation: u64,
    forwarder: JoinHandle<()>,
    /// Sender side only.
    lane: Option<Lane>,
}

impl Attached {
    fn abort(&self) {
        self.forwarder.abort();
        if let Some(lane) = &self.lane {
            lane.worker.abort();
        }
    }
}

pub struct ConnectionHandler {
    coordinator: Arc<SessionCoordinator>,
    peer: PeerHandle,
    outbound: mpsc::UnboundedSender<ServerEvent>,
    /// Live sessions only. A forwarder removes its own entry once its
    /// session has ended.
    sessions: Arc<DashMap<SessionId, Attached>>,
    generation: AtomicU64,
}

impl ConnectionHandler {
    pub fn new(
        coordinator: Arc<SessionCoordinator>,
        peer: PeerHandle,
        outbound: mpsc::UnboundedSender<ServerEvent>,
    ) -> Self {
        Self {
            coordinator,
            peer,
            outbound,
            sessions: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Handle one raw line from the transport. The reply arrives on the
    /// outbound queue.
    pub async fn handle_line(&self, line: &str) {
        match serde_json::from_str::<ClientRequest>(line) {
            Ok(request) => self.dispatch(request).await,
            Err(e) => {
                tracing::warn!(peer = %self.peer, error = %e, "malformed request");
                self.push(ServerEvent::malformed(e.to_string()));
            }
        }
    }

    async fn dispatch(&self, request: ClientRequest) {
        if self.enqueue(&request) {
            return;
        }
        let reply = self.handle(request).await;
        self.push(reply);
    }

    /// Put a chunk or finish on its session's lane. False when there is no
    /// lane and the request runs inline.
    fn enqueue(&self, request: &ClientRequest) -> bool {
        let (session_id, op) = match &request.event {
            ClientEvent::ChunkSend {
                session_id,
                sequence,
                payload,
            } => (
                session_id,
                LaneOp::Chunk {
                    sequence: *sequence,
                    payload: payload.clone(),
                },
            ),
            ClientEvent::Finish { session_id } => (session_id, LaneOp::Finish),
            _ => return false,
        };
        let queue = self
            .sessions
            .get(session_id)
            .and_then(|a| a.lane.as_ref().map(|lane| lane.queue.clone()));
        let Some(queue) = queue else {
            return false;
        };
        queue
            .send(Queued {
                request_id: request.request_id,
                session_id: session_id.clone(),
                op,
            })
            .is_ok()
    }

    async fn handle(&self, request: ClientRequest) -> ServerEvent {
        let result = match request.event {
            ClientEvent::Open {
                declared_size,
                file_name,
            } => self.open(declared_size, file_name).await,

            ClientEvent::Join { session_id } => self.join(session_id).await,

            ClientEvent::ChunkSend {
                session_id,
                sequence,
                payload,
            } => reply(
                self.coordinator
                    .relay_chunk(&session_id, &self.peer, sequence, payload)
                    .await,
            ),

            ClientEvent::ChunkAck {
                session_id,
                sequence,
            } => reply(
                self.coordinator
                    .acknowledge_chunk(&session_id, &self.peer, sequence)
                    .await,
            ),

            ClientEvent::Finish { session_id } => reply(
                self.coordinator
                    .finish_session(&session_id, &self.peer)
                    .await,
            ),

            ClientEvent::Complete { session_id } => reply(
                self.coordinator
                    .complete_session(&session_id, &self.peer)
                    .await,
            ),

            ClientEvent::Cancel { session_id, reason } => {
                let reason = reason.unwrap_or_else(|| "cancelled by peer".to_string());
                reply(
                    self.coordinator
                        .cancel_session(&session_id, &self.peer, &reason)
                        .await,
                )
            }
        };
        respond(request.request_id, result)
    }

    async fn open(
        &self,
        declared_size: i64,
        file_name: Option<String>,
    ) -> Result<serde_json::Value, RelayError> {
        let status = self
            .coordinator
            .open_session(self.peer.clone(), declared_size, file_name)
            .await?;
        let feed = match self.coordinator.attach(&status.session_id, Role::Sender).await {
            Ok(feed) => feed,
            Err(e) => {
                // The client never learns the id, so nobody could end it.
                if let Err(fail) = self
                    .coordinator
                    .fail_session(
                        &status.session_id,
                        FailureReason::MediatorUnavailable,
                        Some(Role::Sender),
                    )
                    .await
                {
                    tracing::warn!(session_id = %status.session_id, error = %fail, "could not fail unattached session");
                }
                return Err(e);
            }
        };
        self.track(feed);
        to_value(&status)
    }

    async fn join(&self, session_id: SessionId) -> Result<serde_json::Value, RelayError> {
        // Subscribe first so the first chunk cannot slip past us.
        let feed = self.coordinator.attach(&session_id, Role::Receiver).await?;
        let status = self
            .coordinator
            .join_session(&session_id, self.peer.clone(), Role::Receiver)
            .await?;
        self.track(feed);
        to_value(&status)
    }

    fn track(&self, mut feed: PeerFeed) {
        let session_id = feed.session_id().clone();
        let role = feed.role();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (registered_tx, registered_rx) = oneshot::channel::<()>();

        let forwarder = {
            let session_id = session_id.clone();
            let outbound = self.outbound.clone();
            let sessions = Arc::clone(&self.sessions);
            let peer = self.peer.clone();
            tokio::spawn(async move {
                while let Some(event) = feed.next().await {
                    if outbound
                        .send(event.into_server_event(session_id.clone()))
                        .is_err()
                    {
                        // Connection is going away; on_disconnect cleans up.
                        return;
                    }
                }
                let _ = registered_rx.await;
                sessions.remove_if(&session_id, |_, attached| attached.generation == generation);
                tracing::debug!(session_id = %session_id, peer = %peer, %role, "feed closed");
            })
        };

        let lane = match role {
            Role::Sender => {
                let (queue, pending) = mpsc::unbounded_channel();
                let worker = tokio::spawn(run_lane(
                    Arc::clone(&self.coordinator),
                    self.peer.clone(),
                    self.outbound.clone(),
                    pending,
                ));
                Some(Lane { queue, worker })
            }
            Role::Receiver => None,
        };

        let attached = Attached {
            generation,
            forwarder,
            lane,
        };
        if let Some(previous) = self.sessions.insert(session_id, attached) {
            previous.abort();
        }
        let _ = registered_tx.send(());
    }

    /// The connection is gone: cancel every live session it was part of.
    pub async fn on_disconnect(&self) {
        let sessions: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in sessions {
            if let Some(status) = self.coordinator.on_peer_disconnect(&id, &self.peer).await {
                tracing::info!(session_id = %id, peer = %self.peer, state = %status.state, "peer disconnected");
            }
            if let Some((_, attached)) = self.sessions.remove(&id) {
                attached.abort();
            }
        }
    }

    fn push(&self, event: ServerEvent) {
        // A closed queue means the connection is already gone.
        let _ = self.outbound.send(event);
    }
}

/// Runs one session's chunks and finish in arrival order.
async fn run_lane(
    coordinator: Arc<SessionCoordinator>,
    peer: PeerHandle,
    outbound: mpsc::UnboundedSender<ServerEvent>,
    mut pending: mpsc::UnboundedReceiver<Queued>,
) {
    while let Some(Queued {
        request_id,
        session_id,
        op,
    }) = pending.recv().await
    {
        let result = match op {
            LaneOp::Chunk { sequence, payload } => reply(
                coordinator
                    .relay_chunk(&session_id, &peer, sequence, payload)
                    .await,
            ),
            LaneOp::Finish => reply(coordinator.finish_session(&session_id, &peer).await),
        };
        if outbound.send(respond(request_id, result)).is_err() {
            break;
        }
    }
}

fn respond(request_id: u64, result: Result<serde_json::Value, RelayError>) -> ServerEvent {
    match result {
        Ok(data) => ServerEvent::ok(request_id, &data),
        Err(e) => ServerEvent::error(request_id, &e),
    }
}

fn reply<T: Serialize>(result: Result<T, RelayError>) -> Result<serde_json::Value, RelayError> {
    result.and_then(|value| to_value(&value))
}

fn to_value<T: Serialize>(value: &T) -> Result<serde_json::Value, RelayError> {
    serde_json::to_value(value).map_err(|e| RelayError::Store(e.to_string()))
}
