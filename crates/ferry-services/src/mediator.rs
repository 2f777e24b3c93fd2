//! Channel mediator — the pub/sub substrate between processes.
//!
//! Contract:
//!   publish   — at-least-once to current subscribers, FIFO per publisher
//!               per channel. Messages published with no subscriber are lost.
//!   subscribe — a lazy stream of envelopes; dropping it unsubscribes.
//!
//! `MemoryMediator` is the in-process reference implementation. It can be
//! told to go dark or to deliver everything twice.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::Stream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use ferry_core::Envelope;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediatorError {
    #[error("mediator unavailable: {0}")]
    Unavailable(String),
    #[error("failed to encode envelope: {0}")]
    Encode(String),
}

/// Stream of envelopes on one channel.
pub type Subscription = Pin<Box<dyn Stream<Item = Envelope> + Send>>;

#[async_trait]
pub trait Mediator: Send + Sync {
    async fn publish(&self, channel: &str, envelope: &Envelope) -> Result<(), MediatorError>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription, MediatorError>;
}

// ── In-memory mediator ────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct MemoryMediator {
    channels: Arc<DashMap<String, broadcast::Sender<Bytes>>>,
    capacity: usize,
    outage: Arc<AtomicBool>,
    duplicate: Arc<AtomicBool>,
}

impl MemoryMediator {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
            outage: Arc::new(AtomicBool::new(false)),
            duplicate: Arc::new(AtomicBool::new(false)),
        }
    }

    /// While set, every publish and subscribe fails.
    pub fn set_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    /// While set, every message is delivered twice.
    pub fn set_duplicate_delivery(&self, on: bool) {
        self.duplicate.store(on, Ordering::SeqCst);
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    fn check_available(&self) -> Result<(), MediatorError> {
        if self.outage.load(Ordering::SeqCst) {
            return Err(MediatorError::Unavailable("injected outage".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryMediator {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Mediator for MemoryMediator {
    async fn publish(&self, channel: &str, envelope: &Envelope) -> Result<(), MediatorError> {
        self.check_available()?;
        let bytes = Bytes::from(
            envelope
                .encode()
                .map_err(|e| MediatorError::Encode(e.to_string()))?,
        );
        let copies = if self.duplicate.load(Ordering::SeqCst) { 2 } else { 1 };

        if let Some(tx) = self.channels.get(channel) {
            for _ in 0..copies {
                // Err means nobody is listening, which the contract allows.
                let _ = tx.send(bytes.clone());
            }
        }
        // Drop channels nobody listens to. `remove_if` holds the shard lock,
        // so a concurrent subscribe either sees the old sender or makes a new one.
        self.channels
            .remove_if(channel, |_, tx| tx.receiver_count() == 0);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, MediatorError> {
        self.check_available()?;
        let rx = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        let name = channel.to_string();
        let stream = BroadcastStream::new(rx).filter_map(move |item| match item {
            Ok(bytes) => match Envelope::decode(&bytes) {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    tracing::warn!(channel = %name, error = %e, "dropping undecodable envelope");
                    None
                }
            },
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                tracing::warn!(channel = %name, missed, "subscriber lagged, messages lost");
                None
            }
        });
        Ok(Box::pin(stream))
    }
}
