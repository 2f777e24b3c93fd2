//! Session coordinator — the public face of the relay.
//!
//! Every operation follows the same shape: read the record (cached view
//! first, registry on conflict), let `TransferSession` decide, write the
//! result back with compare-and-swap, then tell the other peer through the
//! mediator. No lock is held across an await.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;

use ferry_core::config::SessionSettings;
use ferry_core::transfer::{unix_millis, Refusal, Step};
use ferry_core::{
    ChunkReceipt, ControlEvent, Envelope, FailureReason, InstanceId, PeerHandle, RelayError, Role,
    SessionId, SessionState, SessionStatus, TransferSession, Versioned,
};

use crate::feed::PeerFeed;
use crate::flow::CreditWindow;
use crate::mediator::Mediator;
use crate::store::{SessionStore, StoreError};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub idle_timeout: Duration,
    pub grace_period: Duration,
    pub flow_window: u32,
    pub cas_retries: u32,
    pub publish_retries: u32,
    pub publish_backoff: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from(&SessionSettings::default())
    }
}

impl From<&SessionSettings> for CoordinatorConfig {
    fn from(s: &SessionSettings) -> Self {
        Self {
            idle_timeout: s.idle_timeout(),
            grace_period: s.grace_period(),
            flow_window: s.flow_window.max(1),
            cas_retries: s.cas_retries.max(1),
            publish_retries: s.publish_retries.max(1),
            publish_backoff: s.publish_backoff(),
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub expired: usize,
    pub reaped: usize,
}

/// What `apply` is about to write.
enum Write<T> {
    Apply(T),
    Fail(FailureReason),
}

/// A decision that was written back (or found to be unnecessary).
struct Outcome<T> {
    value: T,
    committed: Versioned<TransferSession>,
    changed: bool,
}

#[derive(Clone)]
pub struct SessionCoordinator {
    instance: InstanceId,
    store: Arc<dyn SessionStore>,
    mediator: Arc<dyn Mediator>,
    config: CoordinatorConfig,
    /// Last version this process saw. Only a hint; the registry wins.
    cache: Arc<DashMap<SessionId, Versioned<TransferSession>>>,
    /// Credit windows for sessions whose sender is connected here.
    windows: Arc<DashMap<SessionId, Arc<CreditWindow>>>,
}

impl SessionCoordinator {
    pub fn new(
        instance: InstanceId,
        store: Arc<dyn SessionStore>,
        mediator: Arc<dyn Mediator>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            instance,
            store,
            mediator,
            config,
            cache: Arc::new(DashMap::new()),
            windows: Arc::new(DashMap::new()),
        }
    }

    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    // ── Operations ───────────────────────────────────────────────────────────

    pub async fn open_session(
        &self,
        sender: PeerHandle,
        declared_size: i64,
        file_name: Option<String>,
    ) -> Result<SessionStatus, RelayError> {
        let record = TransferSession::open(
            SessionId::generate(),
            sender,
            declared_size,
            file_name,
            unix_millis(),
        )?;
        let committed = self.store.insert(&record).await.map_err(store_error)?;
        let id = record.id.clone();

        self.windows
            .insert(id.clone(), Arc::new(CreditWindow::new(self.config.flow_window)));
        self.cache.insert(id.clone(), committed);

        tracing::info!(session_id = %id, declared_size, "session opened");
        Ok(record.status())
    }

    pub async fn join_session(
        &self,
        id: &SessionId,
        peer: PeerHandle,
        role: Role,
    ) -> Result<SessionStatus, RelayError> {
        let idle = self.config.idle_timeout;
        let outcome = self
            .apply(id, Some(&peer), |record, now| {
                record.admit(peer.clone(), role, now, idle)?;
                Ok(((), Step::Applied))
            })
            .await?;

        tracing::info!(session_id = %id, peer = %peer, "receiver joined");
        let envelope = Envelope::control(
            id.clone(),
            Some(role),
            outcome.committed.version,
            ControlEvent::PeerJoined { receiver: peer },
        );
        self.publish_or_fail(&envelope).await?;
        Ok(outcome.committed.record.status())
    }

    pub async fn relay_chunk(
        &self,
        id: &SessionId,
        peer: &PeerHandle,
        sequence: u64,
        payload: Bytes,
    ) -> Result<ChunkReceipt, RelayError> {
        let window = self.sender_window(id, peer);
        let credit = match &window {
            Some(window) => match window.acquire(self.config.idle_timeout).await {
                Ok(credit) => Some(credit),
                Err(RelayError::Timeout) => {
                    tracing::warn!(session_id = %id, sequence, "no credit within the idle window");
                    self.fail_session(id, FailureReason::Timeout, Some(Role::Sender))
                        .await?;
                    return Err(RelayError::Timeout);
                }
                Err(e) => return Err(e),
            },
            None => None,
        };

        let len = payload.len() as u64;
        let outcome = self
            .apply(id, Some(peer), |record, now| {
                let receipt = record.accept_chunk(peer, sequence, len, now)?;
                Ok((receipt, Step::Applied))
            })
            .await?;
        if let Some(credit) = credit {
            credit.commit();
        }

        tracing::debug!(session_id = %id, sequence, len, "chunk relayed");
        self.publish_or_fail(&Envelope::chunk(id.clone(), sequence, payload))
            .await?;
        Ok(outcome.value)
    }

    /// Validate a receiver ack on a fresh read and pass it to the sender.
    /// Acks never write the registry.
    pub async fn acknowledge_chunk(
        &self,
        id: &SessionId,
        peer: &PeerHandle,
        sequence: u64,
    ) -> Result<SessionStatus, RelayError> {
        let (current, _) = self.read(id, false).await?;
        match current.record.check_ack(peer, sequence) {
            Ok(Step::Unchanged) => Ok(current.record.status()),
            Ok(Step::Applied) => {
                self.publish_or_fail(&Envelope::ack(id.clone(), sequence))
                    .await?;
                Ok(current.record.status())
            }
            Err(Refusal::Reject(e)) => Err(e),
            Err(Refusal::Violation(reason)) => {
                let origin = current.record.role_of(peer);
                self.violate(id, reason, origin).await
            }
        }
    }

    pub async fn finish_session(
        &self,
        id: &SessionId,
        peer: &PeerHandle,
    ) -> Result<SessionStatus, RelayError> {
        let outcome = self
            .apply(id, Some(peer), |record, now| Ok(((), record.finish(peer, now)?)))
            .await?;
        if outcome.changed {
            let bytes_relayed = outcome.committed.record.bytes_relayed;
            tracing::info!(session_id = %id, bytes_relayed, "sender finished");
            let envelope = Envelope::control(
                id.clone(),
                Some(Role::Sender),
                outcome.committed.version,
                ControlEvent::EndOfStream { bytes_relayed },
            );
            self.publish_or_fail(&envelope).await?;
        }
        Ok(outcome.committed.record.status())
    }

    pub async fn complete_session(
        &self,
        id: &SessionId,
        peer: &PeerHandle,
    ) -> Result<SessionStatus, RelayError> {
        let outcome = self
            .apply(id, Some(peer), |record, now| Ok(((), record.complete(peer, now)?)))
            .await?;
        if outcome.changed {
            tracing::info!(session_id = %id, "session completed");
            self.announce_terminal(&outcome.committed, Some(Role::Receiver), ControlEvent::Completed)
                .await;
        }
        Ok(outcome.committed.record.status())
    }

    /// Idempotent: cancelling a terminal session returns its status.
    pub async fn cancel_session(
        &self,
        id: &SessionId,
        peer: &PeerHandle,
        reason: &str,
    ) -> Result<SessionStatus, RelayError> {
        let outcome = self
            .apply(id, Some(peer), |record, now| record.cancel(peer, reason, now))
            .await?;
        if outcome.changed {
            let role = outcome.value;
            tracing::info!(session_id = %id, %role, reason, "session cancelled");
            self.announce_terminal(
                &outcome.committed,
                Some(role),
                ControlEvent::Cancelled {
                    reason: reason.to_string(),
                },
            )
            .await;
        }
        Ok(outcome.committed.record.status())
    }

    /// A peer's connection went away. Cancels the session unless it is
    /// already over or gone.
    pub async fn on_peer_disconnect(
        &self,
        id: &SessionId,
        peer: &PeerHandle,
    ) -> Option<SessionStatus> {
        match self.cancel_session(id, peer, "peer disconnected").await {
            Ok(status) => Some(status),
            Err(RelayError::SessionNotFound(_)) | Err(RelayError::NotParticipant) => None,
            Err(e) => {
                tracing::warn!(session_id = %id, peer = %peer, error = %e, "disconnect cleanup failed");
                None
            }
        }
    }

    /// Subscribe a peer's connection to its session. A receiver must attach
    /// before joining so no chunk is published ahead of the subscription.
    pub async fn attach(&self, id: &SessionId, role: Role) -> Result<PeerFeed, RelayError> {
        self.read(id, false).await?;
        let control = self
            .mediator
            .subscribe(&id.control_channel())
            .await
            .map_err(|e| RelayError::MediatorUnavailable(e.to_string()))?;
        let data = match role {
            Role::Receiver => Some(
                self.mediator
                    .subscribe(&id.data_channel())
                    .await
                    .map_err(|e| RelayError::MediatorUnavailable(e.to_string()))?,
            ),
            Role::Sender => None,
        };
        let window = match role {
            Role::Sender => self.windows.get(id).map(|w| Arc::clone(w.value())),
            Role::Receiver => None,
        };
        Ok(PeerFeed::new(id.clone(), role, control, data, window))
    }

    pub async fn status(&self, id: &SessionId) -> Result<SessionStatus, RelayError> {
        let (current, _) = self.read(id, false).await?;
        Ok(current.record.status())
    }

    /// Fail idle sessions and reap terminal records past the grace period.
    pub async fn sweep_once(&self, now_ms: u64) -> Result<SweepReport, RelayError> {
        let records = self.store.list().await.map_err(store_error)?;
        let mut report = SweepReport {
            scanned: records.len(),
            ..SweepReport::default()
        };
        let grace_ms = self.config.grace_period.as_millis() as u64;
        let idle = self.config.idle_timeout;

        for Versioned { record, .. } in records {
            let id = record.id.clone();
            if record.state.is_terminal() {
                if now_ms.saturating_sub(record.last_activity_at_ms) > grace_ms {
                    self.remove_record(&id).await;
                    report.reaped += 1;
                }
                continue;
            }
            if !record.is_idle(now_ms, idle) {
                continue;
            }
            match self
                .apply(&id, None, |record, _| Ok(((), record.expire(now_ms, idle))))
                .await
            {
                Ok(outcome) if outcome.changed => {
                    tracing::info!(session_id = %id, "session timed out");
                    self.announce_terminal(
                        &outcome.committed,
                        None,
                        ControlEvent::Failed {
                            reason: FailureReason::Timeout,
                        },
                    )
                    .await;
                    report.expired += 1;
                }
                Ok(_) | Err(RelayError::SessionNotFound(_)) => {}
                Err(e) => tracing::warn!(session_id = %id, error = %e, "sweep failed to expire session"),
            }
        }

        // Local leftovers of sessions another process already removed.
        let live: Vec<SessionId> = self.cache.iter().map(|e| e.key().clone()).collect();
        for id in live {
            if matches!(self.store.load(&id).await, Ok(None)) {
                self.cache.remove(&id);
                if let Some((_, window)) = self.windows.remove(&id) {
                    window.close(SessionState::Cancelled);
                }
            }
        }
        Ok(report)
    }

    // ── Internals ────────────────────────────────────────────────────────────

    /// Credit window for `peer`, if it is this session's sender and the
    /// session was opened here.
    fn sender_window(&self, id: &SessionId, peer: &PeerHandle) -> Option<Arc<CreditWindow>> {
        let is_sender = self
            .cache
            .get(id)
            .map(|v| v.record.role_of(peer) == Some(Role::Sender))
            .unwrap_or(false);
        if !is_sender {
            return None;
        }
        self.windows.get(id).map(|w| Arc::clone(w.value()))
    }

    /// Read a record. Returns whether the view came from the registry.
    async fn read(
        &self,
        id: &SessionId,
        use_cache: bool,
    ) -> Result<(Versioned<TransferSession>, bool), RelayError> {
        let cached = if use_cache {
            self.cache.get(id).map(|v| v.value().clone())
        } else {
            None
        };
        if let Some(cached) = cached {
            return Ok((cached, false));
        }
        match self.store.load(id).await.map_err(store_error)? {
            Some(current) => {
                self.cache.insert(id.clone(), current.clone());
                Ok((current, true))
            }
            None => {
                self.cache.remove(id);
                Err(RelayError::SessionNotFound(id.clone()))
            }
        }
    }

    /// Optimistic read-decide-write loop.
    ///
    /// The first attempt may decide on the cached view. A refusal or no-op
    /// decided on a cached view is re-checked against the registry before
    /// it is returned. A violation is written as Failed in the same loop and
    /// returned to the caller as an error.
    async fn apply<T, F>(
        &self,
        id: &SessionId,
        caller: Option<&PeerHandle>,
        mut decide: F,
    ) -> Result<Outcome<T>, RelayError>
    where
        F: FnMut(&mut TransferSession, u64) -> Result<(T, Step), Refusal>,
    {
        let mut use_cache = true;
        let mut conflicts = 0u32;

        loop {
            let (current, fresh) = self.read(id, use_cache).await?;
            use_cache = false;

            let now = unix_millis();
            let mut record = current.record.clone();
            let decision = decide(&mut record, now);
            if !fresh && !matches!(decision, Ok((_, Step::Applied))) {
                continue;
            }

            let write = match decision {
                Ok((value, Step::Applied)) => Write::Apply(value),
                Ok((value, Step::Unchanged)) => {
                    return Ok(Outcome {
                        value,
                        committed: current,
                        changed: false,
                    })
                }
                Err(Refusal::Reject(e)) => {
                    tracing::warn!(session_id = %id, error = %e, "operation rejected");
                    return Err(e);
                }
                Err(Refusal::Violation(reason)) => {
                    record = current.record.clone();
                    record.fail(reason.clone(), now);
                    Write::Fail(reason)
                }
            };

            match self.store.compare_and_swap(current.version, &record).await {
                Ok(committed) => {
                    self.cache.insert(id.clone(), committed.clone());
                    if committed.record.state.is_terminal() {
                        self.release(&committed).await;
                    }
                    return match write {
                        Write::Apply(value) => Ok(Outcome {
                            value,
                            committed,
                            changed: true,
                        }),
                        Write::Fail(reason) => {
                            let origin = caller.and_then(|p| current.record.role_of(p));
                            tracing::warn!(session_id = %id, reason = %reason, "protocol violation, session failed");
                            self.announce_terminal(
                                &committed,
                                origin,
                                ControlEvent::Failed {
                                    reason: reason.clone(),
                                },
                            )
                            .await;
                            Err(reason.into())
                        }
                    };
                }
                Err(StoreError::Stale { expected, found }) => {
                    if fresh {
                        conflicts += 1;
                    }
                    tracing::debug!(session_id = %id, expected, found, conflicts, "stale write, retrying");
                    if conflicts >= self.config.cas_retries {
                        tracing::warn!(session_id = %id, attempts = conflicts, "giving up on contended session");
                        return Err(RelayError::Contended {
                            attempts: conflicts,
                        });
                    }
                }
                Err(StoreError::NotFound(_)) => {
                    self.cache.remove(id);
                    return Err(RelayError::SessionNotFound(id.clone()));
                }
                Err(e) => return Err(store_error(e)),
            }
        }
    }

    /// Fail the session for a protocol violation and report it to the caller.
    async fn violate(
        &self,
        id: &SessionId,
        reason: FailureReason,
        origin: Option<Role>,
    ) -> Result<SessionStatus, RelayError> {
        tracing::warn!(session_id = %id, reason = %reason, "protocol violation");
        self.fail_session(id, reason.clone(), origin).await?;
        Err(reason.into())
    }

    /// Move to Failed (no-op if already terminal) and tell the other peer.
    pub(crate) async fn fail_session(
        &self,
        id: &SessionId,
        reason: FailureReason,
        origin: Option<Role>,
    ) -> Result<SessionStatus, RelayError> {
        let outcome = self
            .apply(id, None, |record, now| Ok(((), record.fail(reason.clone(), now))))
            .await?;
        if outcome.changed {
            tracing::info!(session_id = %id, reason = %reason, "session failed");
            self.announce_terminal(&outcome.committed, origin, ControlEvent::Failed { reason })
                .await;
        }
        Ok(outcome.committed.record.status())
    }

    /// Publish with retry; on exhaustion the session fails with
    /// MediatorUnavailable and the caller gets the error.
    async fn publish_or_fail(&self, envelope: &Envelope) -> Result<(), RelayError> {
        let Err(e) = self.publish_with_retry(envelope).await else {
            return Ok(());
        };
        tracing::warn!(session_id = %envelope.session_id, error = %e, "failing session after publish retries");
        self.fail_session(
            &envelope.session_id,
            FailureReason::MediatorUnavailable,
            envelope.origin,
        )
        .await?;
        Err(e)
    }

    /// The terminal state is already committed; a lost notification can only
    /// be logged. The other peer learns from its next operation or the sweep.
    async fn announce_terminal(
        &self,
        committed: &Versioned<TransferSession>,
        origin: Option<Role>,
        event: ControlEvent,
    ) {
        let envelope = Envelope::control(committed.record.id.clone(), origin, committed.version, event);
        if let Err(e) = self.publish_with_retry(&envelope).await {
            tracing::error!(
                session_id = %committed.record.id,
                state = %committed.record.state,
                error = %e,
                "terminal event not delivered"
            );
        }
    }

    async fn publish_with_retry(&self, envelope: &Envelope) -> Result<(), RelayError> {
        let channel = envelope.channel();
        let mut attempt = 1;
        loop {
            match self.mediator.publish(&channel, envelope).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.config.publish_retries => {
                    return Err(RelayError::MediatorUnavailable(e.to_string()))
                }
                Err(e) => {
                    tracing::warn!(channel = %channel, attempt, error = %e, "publish failed, retrying");
                    tokio::time::sleep(self.config.publish_backoff * attempt).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Called once a terminal state is committed.
    async fn release(&self, committed: &Versioned<TransferSession>) {
        let id = &committed.record.id;
        if let Some((_, window)) = self.windows.remove(id) {
            window.close(committed.record.state);
        }
        // With a grace period the record lingers so late messages are
        // no-ops; the sweep reaps it.
        if self.config.grace_period.is_zero() {
            self.remove_record(id).await;
        }
    }

    async fn remove_record(&self, id: &SessionId) {
        self.cache.remove(id);
        if let Some((_, window)) = self.windows.remove(id) {
            window.close(SessionState::Cancelled);
        }
        match self.store.remove(id).await {
            Ok(true) => tracing::debug!(session_id = %id, "session released"),
            Ok(false) => {}
            Err(e) => tracing::warn!(session_id = %id, error = %e, "failed to release session"),
        }
    }
}

fn store_error(e: StoreError) -> RelayError {
    match e {
        StoreError::NotFound(id) => RelayError::SessionNotFound(id),
        StoreError::Stale { .. } => RelayError::StaleWrite,
        other => RelayError::Store(other.to_string()),
    }
}
