//! Backpressure: the sender waits once the credit window is full.

use std::time::Duration;

use ferry_core::{FailureReason, RelayError, SessionState};
use ferry_services::{CoordinatorConfig, PeerEvent, PeerFeed};

use crate::*;

fn windowed(flow_window: u32, idle_timeout: Duration) -> Cluster {
    Cluster::with_config(CoordinatorConfig {
        flow_window,
        idle_timeout,
        ..test_config()
    })
}

/// The sender's feed has to be polled for acks to return credit.
fn drain(mut feed: PeerFeed) -> tokio::task::JoinHandle<Vec<PeerEvent>> {
    tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(event) = feed.next().await {
            seen.push(event);
        }
        seen
    })
}

#[tokio::test]
async fn test_full_window_blocks_until_ack() {
    let cluster = windowed(2, Duration::from_secs(5));
    let t = cluster.paired(100).await;
    let _acks = drain(t.sender_feed);
    let sender = cluster.sender();

    for seq in 0..2 {
        cluster
            .a
            .relay_chunk(&t.id, &sender, seq, chunk_bytes(10, 0))
            .await
            .unwrap();
    }

    let mut blocked = {
        let a = cluster.a.clone();
        let id = t.id.clone();
        tokio::spawn(async move { a.relay_chunk(&id, &sender, 2, chunk_bytes(10, 0)).await })
    };
    assert!(
        tokio::time::timeout(Duration::from_millis(100), &mut blocked)
            .await
            .is_err(),
        "third chunk went out with a full window"
    );

    cluster
        .b
        .acknowledge_chunk(&t.id, &cluster.receiver(), 0)
        .await
        .unwrap();
    let receipt = tokio::time::timeout(EVENT_WAIT, blocked)
        .await
        .expect("ack did not release the sender")
        .unwrap()
        .unwrap();
    assert_eq!(receipt.sequence, 2);
}

#[tokio::test]
async fn test_cumulative_ack_returns_every_credit() {
    let cluster = windowed(4, Duration::from_secs(5));
    let t = cluster.paired(80).await;
    let _acks = drain(t.sender_feed);
    let sender = cluster.sender();

    for seq in 0..4 {
        cluster
            .a
            .relay_chunk(&t.id, &sender, seq, chunk_bytes(10, 0))
            .await
            .unwrap();
    }
    cluster
        .b
        .acknowledge_chunk(&t.id, &cluster.receiver(), 3)
        .await
        .unwrap();

    for seq in 4..8 {
        let sent = tokio::time::timeout(
            EVENT_WAIT,
            cluster.a.relay_chunk(&t.id, &sender, seq, chunk_bytes(10, 0)),
        )
        .await
        .expect("credit was not returned");
        assert_eq!(sent.unwrap().sequence, seq);
    }
}

#[tokio::test]
async fn test_starved_sender_times_out() {
    let cluster = windowed(1, Duration::from_millis(300));
    let mut t = cluster.paired(100).await;
    let sender = cluster.sender();

    cluster
        .a
        .relay_chunk(&t.id, &sender, 0, chunk_bytes(10, 0))
        .await
        .unwrap();
    assert!(matches!(
        next_event(&mut t.receiver_feed).await,
        Some(PeerEvent::Chunk { sequence: 0, .. })
    ));

    assert_eq!(
        cluster
            .a
            .relay_chunk(&t.id, &sender, 1, chunk_bytes(10, 0))
            .await,
        Err(RelayError::Timeout)
    );
    assert_eq!(
        next_event(&mut t.receiver_feed).await,
        Some(PeerEvent::Failed {
            reason: FailureReason::Timeout
        })
    );
    assert_eq!(
        cluster.b.status(&t.id).await.unwrap().state,
        SessionState::Failed
    );
}

#[tokio::test]
async fn test_cancel_wakes_a_waiting_sender() {
    let cluster = windowed(1, Duration::from_secs(5));
    let t = cluster.paired(100).await;
    let _events = drain(t.sender_feed);
    let sender = cluster.sender();

    cluster
        .a
        .relay_chunk(&t.id, &sender, 0, chunk_bytes(10, 0))
        .await
        .unwrap();
    let waiting = {
        let a = cluster.a.clone();
        let id = t.id.clone();
        let sender = sender.clone();
        tokio::spawn(async move { a.relay_chunk(&id, &sender, 1, chunk_bytes(10, 0)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    cluster
        .a
        .cancel_session(&t.id, &sender, "abort")
        .await
        .unwrap();
    let result = tokio::time::timeout(EVENT_WAIT, waiting)
        .await
        .expect("waiting sender was not woken")
        .unwrap();
    assert_eq!(
        result,
        Err(RelayError::SessionTerminated(SessionState::Cancelled))
    );
}
