//! End-to-end transfer scenarios across two instances.

use ferry_core::transfer::unix_millis;
use ferry_core::{FailureReason, RelayError, Role, SessionState};
use ferry_services::PeerEvent;

use crate::*;

/// 1024 bytes in four 256-byte chunks, acked one by one.
#[tokio::test]
async fn test_full_transfer_completes() {
    let cluster = Cluster::new();
    let mut t = cluster.paired(1024).await;
    let (sender, receiver) = (cluster.sender(), cluster.receiver());

    for seq in 0..4u64 {
        let receipt = cluster
            .a
            .relay_chunk(&t.id, &sender, seq, chunk_bytes(256, seq as u8))
            .await
            .unwrap();
        assert_eq!(receipt.sequence, seq);
        assert_eq!(receipt.bytes_relayed, (seq + 1) * 256);

        match next_event(&mut t.receiver_feed).await {
            Some(PeerEvent::Chunk { sequence, payload }) => {
                assert_eq!(sequence, seq);
                assert_eq!(payload.len(), 256);
                assert!(payload.iter().all(|b| *b == seq as u8));
            }
            other => panic!("expected chunk {seq}, got {other:?}"),
        }
        cluster.b.acknowledge_chunk(&t.id, &receiver, seq).await.unwrap();
        assert_eq!(
            next_event(&mut t.sender_feed).await,
            Some(PeerEvent::ChunkAcked { sequence: seq })
        );
    }

    let finishing = cluster.a.finish_session(&t.id, &sender).await.unwrap();
    assert_eq!(finishing.state, SessionState::Completing);
    assert_eq!(
        next_event(&mut t.receiver_feed).await,
        Some(PeerEvent::EndOfStream {
            bytes_relayed: 1024
        })
    );

    let done = cluster.b.complete_session(&t.id, &receiver).await.unwrap();
    assert_eq!(done.state, SessionState::Completed);
    assert_eq!(done.bytes_relayed, 1024);
    assert_eq!(next_event(&mut t.sender_feed).await, Some(PeerEvent::Completed));
    assert_eq!(next_event(&mut t.sender_feed).await, None);
    assert_eq!(next_event(&mut t.receiver_feed).await, None);

    let seen_by_a = cluster.a.status(&t.id).await.unwrap();
    assert_eq!(seen_by_a.state, SessionState::Completed);
}

/// Finishing before anyone joined is rejected and poisons the session.
#[tokio::test]
async fn test_finish_before_join_expires_the_session() {
    let cluster = Cluster::new();
    let (id, _feed) = cluster.open(10).await;
    let sender = cluster.sender();

    assert!(matches!(
        cluster.a.relay_chunk(&id, &sender, 0, chunk_bytes(10, 1)).await,
        Err(RelayError::InvalidState { .. })
    ));
    assert!(matches!(
        cluster.a.finish_session(&id, &sender).await,
        Err(RelayError::InvalidState { .. })
    ));

    let _receiver_feed = cluster.b.attach(&id, Role::Receiver).await.unwrap();
    assert!(matches!(
        cluster.b.join_session(&id, cluster.receiver(), Role::Receiver).await,
        Err(RelayError::SessionExpired(_))
    ));
    let status = cluster.b.status(&id).await.unwrap();
    assert_eq!(status.failure, Some(FailureReason::PrematureFinish));
}

/// A sequence gap fails the session and the receiver hears about it.
#[tokio::test]
async fn test_out_of_order_chunk_fails_session() {
    let cluster = Cluster::new();
    let mut t = cluster.paired(1024).await;

    assert_eq!(
        cluster
            .a
            .relay_chunk(&t.id, &cluster.sender(), 5, chunk_bytes(8, 0))
            .await,
        Err(RelayError::SequenceMismatch {
            expected: 0,
            got: 5
        })
    );
    assert_eq!(
        next_event(&mut t.receiver_feed).await,
        Some(PeerEvent::Failed {
            reason: FailureReason::SequenceMismatch {
                expected: 0,
                got: 5
            }
        })
    );
    assert_eq!(
        cluster.b.status(&t.id).await.unwrap().state,
        SessionState::Failed
    );
}

/// Receiver drops mid-transfer: cancelled, sender told, later chunks refused.
#[tokio::test]
async fn test_receiver_disconnect_cancels_transfer() {
    let cluster = Cluster::new();
    let mut t = cluster.paired(1024).await;
    let sender = cluster.sender();

    for seq in 0..2 {
        cluster
            .a
            .relay_chunk(&t.id, &sender, seq, chunk_bytes(100, 7))
            .await
            .unwrap();
    }

    let status = cluster
        .b
        .on_peer_disconnect(&t.id, &cluster.receiver())
        .await
        .unwrap();
    assert_eq!(status.state, SessionState::Cancelled);
    assert_eq!(
        next_event(&mut t.sender_feed).await,
        Some(PeerEvent::Cancelled {
            reason: "peer disconnected".into()
        })
    );

    assert_eq!(
        cluster
            .a
            .relay_chunk(&t.id, &sender, 2, chunk_bytes(100, 7))
            .await,
        Err(RelayError::SessionTerminated(SessionState::Cancelled))
    );
}

/// Idle past the window: the sweep fails the session, then reaps it.
#[tokio::test]
async fn test_idle_session_times_out_and_is_removed() {
    let cluster = Cluster::new();
    let mut t = cluster.paired(1024).await;
    let config = test_config();
    let later = unix_millis() + config.idle_timeout.as_millis() as u64 + 1_000;

    let report = cluster.b.sweep_once(later).await.unwrap();
    assert_eq!(report.expired, 1);
    for feed in [&mut t.sender_feed, &mut t.receiver_feed] {
        assert_eq!(
            next_event(feed).await,
            Some(PeerEvent::Failed {
                reason: FailureReason::Timeout
            })
        );
    }

    let reap_at = later + config.grace_period.as_millis() as u64 + 1;
    let report = cluster.a.sweep_once(reap_at).await.unwrap();
    assert_eq!(report.reaped, 1);
    assert!(cluster.store.is_empty());
    assert!(matches!(
        cluster.b.status(&t.id).await,
        Err(RelayError::SessionNotFound(_))
    ));
}

/// A fresh session is not touched by the sweep.
#[tokio::test]
async fn test_sweep_leaves_active_sessions_alone() {
    let cluster = Cluster::new();
    let t = cluster.paired(10).await;
    let report = cluster.a.sweep_once(unix_millis()).await.unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.expired, 0);
    assert_eq!(
        cluster.a.status(&t.id).await.unwrap().state,
        SessionState::Active
    );
}
