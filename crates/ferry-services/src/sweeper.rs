//! Sweeper — the only component that moves sessions without a peer action.
//! Fails idle sessions with Timeout and reaps terminal records.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use ferry_core::transfer::unix_millis;

use crate::coordinator::SessionCoordinator;

pub struct Sweeper {
    coordinator: Arc<SessionCoordinator>,
    interval: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl Sweeper {
    pub fn new(
        coordinator: Arc<SessionCoordinator>,
        interval: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            coordinator,
            interval,
            shutdown,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("sweeper shutting down");
                    return Ok(());
                }

                _ = interval.tick() => {
                    match self.coordinator.sweep_once(unix_millis()).await {
                        Ok(report) if report.expired > 0 || report.reaped > 0 => {
                            tracing::info!(
                                scanned = report.scanned,
                                expired = report.expired,
                                reaped = report.reaped,
                                "sweep finished"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "sweep failed"),
                    }
                }
            }
        }
    }
}
