//! Mediator misbehaviour: redelivery and outages.

use std::time::Duration;

use ferry_core::{FailureReason, RelayError, Role, SessionState};
use ferry_services::PeerEvent;

use crate::*;

/// Every message arrives twice; each peer still sees each event once.
#[tokio::test]
async fn test_duplicate_delivery_is_filtered() {
    let cluster = Cluster::new();
    let mut t = cluster.paired(30).await;
    cluster.mediator.set_duplicate_delivery(true);
    let (sender, receiver) = (cluster.sender(), cluster.receiver());

    for seq in 0..3u64 {
        cluster
            .a
            .relay_chunk(&t.id, &sender, seq, chunk_bytes(10, seq as u8))
            .await
            .unwrap();
    }
    for seq in 0..3u64 {
        match next_event(&mut t.receiver_feed).await {
            Some(PeerEvent::Chunk { sequence, .. }) => assert_eq!(sequence, seq),
            other => panic!("expected chunk {seq}, got {other:?}"),
        }
    }

    cluster.b.acknowledge_chunk(&t.id, &receiver, 2).await.unwrap();
    assert_eq!(
        next_event(&mut t.sender_feed).await,
        Some(PeerEvent::ChunkAcked { sequence: 2 })
    );

    cluster.a.finish_session(&t.id, &sender).await.unwrap();
    assert_eq!(
        next_event(&mut t.receiver_feed).await,
        Some(PeerEvent::EndOfStream { bytes_relayed: 30 })
    );
    assert!(stays_quiet(&mut t.receiver_feed, Duration::from_millis(100)).await);

    cluster.b.complete_session(&t.id, &receiver).await.unwrap();
    assert_eq!(next_event(&mut t.sender_feed).await, Some(PeerEvent::Completed));
    assert_eq!(next_event(&mut t.sender_feed).await, None);
}

/// Publishing a chunk during an outage fails the session after retries.
#[tokio::test]
async fn test_mediator_outage_fails_the_session() {
    let cluster = Cluster::new();
    let t = cluster.paired(100).await;

    cluster.mediator.set_outage(true);
    assert!(matches!(
        cluster
            .a
            .relay_chunk(&t.id, &cluster.sender(), 0, chunk_bytes(10, 0))
            .await,
        Err(RelayError::MediatorUnavailable(_))
    ));
    cluster.mediator.set_outage(false);

    let status = cluster.b.status(&t.id).await.unwrap();
    assert_eq!(status.state, SessionState::Failed);
    assert_eq!(status.failure, Some(FailureReason::MediatorUnavailable));
}

#[tokio::test]
async fn test_attach_during_outage_reports_unavailable() {
    let cluster = Cluster::new();
    let (id, _feed) = cluster.open(100).await;

    cluster.mediator.set_outage(true);
    assert!(matches!(
        cluster.b.attach(&id, Role::Receiver).await,
        Err(RelayError::MediatorUnavailable(_))
    ));
    cluster.mediator.set_outage(false);

    // Nothing was written, the session can still be joined.
    let _feed = cluster.b.attach(&id, Role::Receiver).await.unwrap();
    cluster
        .b
        .join_session(&id, cluster.receiver(), Role::Receiver)
        .await
        .unwrap();
}
