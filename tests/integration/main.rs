//! Ferry integration test harness.
//!
//! Every test runs two coordinators, `edge-a` and `edge-b`, sharing one
//! registry store and one mediator, the way two processes behind a load
//! balancer would. The sender connects to A and the receiver to B, so
//! every chunk and control event crosses the mediator.

use std::sync::Arc;
use std::time::Duration;

use ferry_core::{ConnectionId, InstanceId, PeerHandle, Role, SessionId};
use ferry_services::{
    CoordinatorConfig, MemoryMediator, MemoryStore, PeerEvent, PeerFeed, SessionCoordinator,
};

mod concurrency;
mod faults;
mod flow;
mod scenarios;

// ── Harness ───────────────────────────────────────────────────────────────────

/// How long a test waits for an event before calling it lost.
pub const EVENT_WAIT: Duration = Duration::from_secs(2);

pub fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        idle_timeout: Duration::from_secs(5),
        grace_period: Duration::from_secs(30),
        publish_backoff: Duration::from_millis(1),
        ..CoordinatorConfig::default()
    }
}

pub struct Cluster {
    pub store: MemoryStore,
    pub mediator: MemoryMediator,
    pub a: SessionCoordinator,
    pub b: SessionCoordinator,
}

/// A session with the sender on A, the receiver joined on B, and both
/// feeds attached.
pub struct Transfer {
    pub id: SessionId,
    pub sender_feed: PeerFeed,
    pub receiver_feed: PeerFeed,
}

impl Cluster {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: CoordinatorConfig) -> Self {
        let store = MemoryStore::new();
        let mediator = MemoryMediator::new(256);
        let node = |name: &str| {
            SessionCoordinator::new(
                InstanceId(name.to_string()),
                Arc::new(store.clone()),
                Arc::new(mediator.clone()),
                config.clone(),
            )
        };
        let a = node("edge-a");
        let b = node("edge-b");
        Self {
            store,
            mediator,
            a,
            b,
        }
    }

    pub fn sender(&self) -> PeerHandle {
        PeerHandle::new(ConnectionId(1), self.a.instance().clone())
    }

    pub fn receiver(&self) -> PeerHandle {
        PeerHandle::new(ConnectionId(1), self.b.instance().clone())
    }

    pub async fn open(&self, declared_size: i64) -> (SessionId, PeerFeed) {
        let status = self
            .a
            .open_session(self.sender(), declared_size, Some("report.pdf".into()))
            .await
            .unwrap();
        let feed = self.a.attach(&status.session_id, Role::Sender).await.unwrap();
        (status.session_id, feed)
    }

    pub async fn paired(&self, declared_size: i64) -> Transfer {
        let (id, mut sender_feed) = self.open(declared_size).await;
        let receiver_feed = self.b.attach(&id, Role::Receiver).await.unwrap();
        self.b
            .join_session(&id, self.receiver(), Role::Receiver)
            .await
            .unwrap();
        assert_eq!(next_event(&mut sender_feed).await, Some(PeerEvent::PeerJoined));
        Transfer {
            id,
            sender_feed,
            receiver_feed,
        }
    }
}

pub async fn next_event(feed: &mut PeerFeed) -> Option<PeerEvent> {
    tokio::time::timeout(EVENT_WAIT, feed.next())
        .await
        .expect("timed out waiting for a peer event")
}

/// True if the feed stays silent for `quiet`.
pub async fn stays_quiet(feed: &mut PeerFeed, quiet: Duration) -> bool {
    tokio::time::timeout(quiet, feed.next()).await.is_err()
}

pub fn chunk_bytes(len: usize, fill: u8) -> bytes::Bytes {
    bytes::Bytes::from(vec![fill; len])
}

// ── Harness sanity ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_instances_share_one_registry() {
    let cluster = Cluster::new();
    let (id, _feed) = cluster.open(64).await;
    let seen_by_b = cluster.b.status(&id).await.unwrap();
    assert_eq!(seen_by_b.file_name.as_deref(), Some("report.pdf"));
    assert_eq!(cluster.store.len(), 1);
}
