//! Races between peers and instances, settled by compare-and-swap.

use std::time::Duration;

use tokio_stream::StreamExt;

use ferry_core::{
    ConnectionId, ControlEvent, EnvelopeBody, PeerHandle, RelayError, Role, SessionState,
};
use ferry_services::{Mediator, PeerEvent};

use crate::*;

#[tokio::test]
async fn test_simultaneous_joins_admit_exactly_one() {
    let cluster = Cluster::new();
    let (id, _feed) = cluster.open(100).await;
    let on_a = PeerHandle::new(ConnectionId(2), cluster.a.instance().clone());
    let on_b = cluster.receiver();

    let (ja, jb) = tokio::join!(
        cluster.a.join_session(&id, on_a, Role::Receiver),
        cluster.b.join_session(&id, on_b, Role::Receiver),
    );
    let outcomes = [ja, jb];
    let winners = outcomes.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1, "outcomes: {outcomes:?}");
    assert!(outcomes
        .iter()
        .any(|r| *r == Err(RelayError::RoleOccupied(Role::Receiver))));
    assert_eq!(
        cluster.a.status(&id).await.unwrap().state,
        SessionState::Active
    );
}

#[tokio::test]
async fn test_many_concurrent_joiners() {
    let cluster = Cluster::new();
    let (id, _feed) = cluster.open(100).await;

    let mut tasks = Vec::new();
    for n in 0..8u64 {
        let node = if n % 2 == 0 {
            cluster.a.clone()
        } else {
            cluster.b.clone()
        };
        let id = id.clone();
        let peer = PeerHandle::new(ConnectionId(10 + n), node.instance().clone());
        tasks.push(tokio::spawn(async move {
            node.join_session(&id, peer, Role::Receiver).await
        }));
    }

    let mut admitted = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(RelayError::RoleOccupied(Role::Receiver)) | Err(RelayError::Contended { .. }) => {}
            Err(e) => panic!("unexpected join error: {e}"),
        }
    }
    assert_eq!(admitted, 1);
}

/// Both peers cancel from different instances; one Cancelled event goes out.
#[tokio::test]
async fn test_cancel_from_both_sides_publishes_once() {
    let cluster = Cluster::new();
    let mut t = cluster.paired(100).await;
    let mut control = cluster
        .mediator
        .subscribe(&t.id.control_channel())
        .await
        .unwrap();

    let first = cluster
        .b
        .cancel_session(&t.id, &cluster.receiver(), "receiver changed mind")
        .await
        .unwrap();
    let second = cluster
        .a
        .cancel_session(&t.id, &cluster.sender(), "sender gave up")
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(second.cancel_reason.as_deref(), Some("receiver changed mind"));

    let late = cluster
        .b
        .on_peer_disconnect(&t.id, &cluster.receiver())
        .await
        .unwrap();
    assert_eq!(late.state, SessionState::Cancelled);

    assert_eq!(
        next_event(&mut t.sender_feed).await,
        Some(PeerEvent::Cancelled {
            reason: "receiver changed mind".into()
        })
    );
    assert_eq!(next_event(&mut t.receiver_feed).await, None);

    let mut cancellations = 0;
    while let Ok(Some(envelope)) =
        tokio::time::timeout(Duration::from_millis(100), control.next()).await
    {
        if let EnvelopeBody::Control {
            event: ControlEvent::Cancelled { .. },
            ..
        } = envelope.body
        {
            cancellations += 1;
        }
    }
    assert_eq!(cancellations, 1);
}

/// A's cached view is stale after B moves the session on; A must notice.
#[tokio::test]
async fn test_stale_cache_defers_to_registry() {
    let cluster = Cluster::new();
    let (id, _feed) = cluster.open(100).await;
    // A cached the session at AwaitingPeer when it opened it.
    cluster
        .b
        .join_session(&id, cluster.receiver(), Role::Receiver)
        .await
        .unwrap();

    let receipt = cluster
        .a
        .relay_chunk(&id, &cluster.sender(), 0, chunk_bytes(10, 0))
        .await
        .unwrap();
    assert_eq!(receipt.bytes_relayed, 10);
}
