//! Client transport — newline-delimited JSON over TCP.
//!
//! One task per connection. The reader feeds lines to the connection's
//! handler; a writer task drains the outbound queue (replies and pushed
//! peer events) back onto the socket. Replies may arrive out of request
//! order; clients match them by `request_id`.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

use ferry_core::wire::ServerEvent;
use ferry_core::{ConnectionId, InstanceId, PeerHandle};
use ferry_services::{ConnectionHandler, SessionCoordinator};

pub async fn serve(
    listener: TcpListener,
    coordinator: Arc<SessionCoordinator>,
    instance: InstanceId,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mut next_connection = 1u64;

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("client listener shutting down");
                return Ok(());
            }

            accepted = listener.accept() => {
                let (stream, addr) = accepted.context("accept failed")?;
                let connection = ConnectionId(next_connection);
                next_connection += 1;
                let peer = PeerHandle::new(connection, instance.clone());
                tracing::debug!(peer = %peer, addr = %addr, "client connected");

                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, coordinator, peer.clone()).await {
                        tracing::warn!(peer = %peer, error = %e, "connection ended with error");
                    }
                });
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    coordinator: Arc<SessionCoordinator>,
    peer: PeerHandle,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerEvent>();

    let writer = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            let mut line = serde_json::to_vec(&event).context("failed to encode event")?;
            line.push(b'\n');
            write_half
                .write_all(&line)
                .await
                .context("failed to write to client")?;
        }
        anyhow::Ok(())
    });

    let handler = ConnectionHandler::new(coordinator, peer.clone(), outbound_tx);
    let mut lines = BufReader::new(read_half).lines();
    let read_result = loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                handler.handle_line(&line).await;
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(e).context("failed to read from client"),
        }
    };

    tracing::debug!(peer = %peer, "client disconnected");
    handler.on_disconnect().await;
    drop(handler);
    writer.await.context("writer task panicked")??;
    read_result
}
