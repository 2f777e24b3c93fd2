//! Flow control — per-session credit window on the sender's process.
//!
//! Each relayed chunk costs one credit. Credits come back when the receiver
//! acknowledges; acks are cumulative, so an ack of `n` returns the credits
//! of every relayed chunk up to and including `n`. An empty window makes
//! the sender wait.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{Semaphore, SemaphorePermit};

use ferry_core::{RelayError, SessionState};

#[derive(Debug, Default)]
struct Ledger {
    /// Chunks relayed through this window.
    issued: u64,
    /// Chunks whose credit has come back.
    released: u64,
    closed_as: Option<SessionState>,
}

#[derive(Debug)]
pub struct CreditWindow {
    permits: Semaphore,
    ledger: Mutex<Ledger>,
}

/// A reserved credit. Dropping it returns the credit; `commit` spends it.
pub struct Credit<'a> {
    permit: SemaphorePermit<'a>,
    window: &'a CreditWindow,
}

impl<'a> Credit<'a> {
    /// The chunk went out; keep the credit until it is acknowledged.
    pub fn commit(self) {
        self.permit.forget();
        if let Ok(mut ledger) = self.window.ledger.lock() {
            ledger.issued += 1;
        }
    }
}

impl CreditWindow {
    pub fn new(size: u32) -> Self {
        let size = size.max(1);
        Self {
            permits: Semaphore::new(size as usize),
            ledger: Mutex::new(Ledger::default()),
        }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Chunks relayed but not yet acknowledged.
    pub fn outstanding(&self) -> u64 {
        self.ledger
            .lock()
            .map(|l| l.issued - l.released)
            .unwrap_or(0)
    }

    /// Wait for a credit, at most `patience`.
    pub async fn acquire(&self, patience: Duration) -> Result<Credit<'_>, RelayError> {
        match tokio::time::timeout(patience, self.permits.acquire()).await {
            Err(_) => Err(RelayError::Timeout),
            Ok(Err(_)) => Err(RelayError::SessionTerminated(self.closed_as())),
            Ok(Ok(permit)) => Ok(Credit {
                permit,
                window: self,
            }),
        }
    }

    /// Return credits for every relayed chunk with sequence `<= sequence`.
    /// Returns how many credits came back.
    pub fn release_through(&self, sequence: u64) -> u64 {
        let Ok(mut ledger) = self.ledger.lock() else {
            return 0;
        };
        let upto = sequence.saturating_add(1).min(ledger.issued);
        if upto <= ledger.released {
            return 0;
        }
        let returned = upto - ledger.released;
        ledger.released = upto;
        self.permits.add_permits(returned as usize);
        returned
    }

    /// Wake every waiter with `SessionTerminated`.
    pub fn close(&self, state: SessionState) {
        if let Ok(mut ledger) = self.ledger.lock() {
            ledger.closed_as.get_or_insert(state);
        }
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    fn closed_as(&self) -> SessionState {
        self.ledger
            .lock()
            .ok()
            .and_then(|l| l.closed_as)
            .unwrap_or(SessionState::Cancelled)
    }
}
