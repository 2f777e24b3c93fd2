//! Delivery ledger — filters mediator redeliveries for one feed.
//!
//! Keys:
//!   Control — registry version that committed the event
//!   Chunk   — sequence; anything below the next expected one was seen
//!   Ack     — cumulative; only a higher sequence is news

use std::collections::HashSet;

/// What to do with an incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Fresh,
    Duplicate,
    /// Fresh, but earlier chunks never arrived.
    Gap { expected: u64 },
}

#[derive(Debug, Default)]
pub struct DeliveryLedger {
    control_versions: HashSet<u64>,
    next_chunk: u64,
    highest_ack: Option<u64>,
    duplicates: u64,
}

impl DeliveryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn control(&mut self, version: u64) -> Delivery {
        if self.control_versions.insert(version) {
            Delivery::Fresh
        } else {
            self.duplicate()
        }
    }

    pub fn chunk(&mut self, sequence: u64) -> Delivery {
        if sequence < self.next_chunk {
            return self.duplicate();
        }
        let expected = self.next_chunk;
        self.next_chunk = sequence + 1;
        if sequence == expected {
            Delivery::Fresh
        } else {
            Delivery::Gap { expected }
        }
    }

    pub fn ack(&mut self, sequence: u64) -> Delivery {
        match self.highest_ack {
            Some(seen) if sequence <= seen => self.duplicate(),
            _ => {
                self.highest_ack = Some(sequence);
                Delivery::Fresh
            }
        }
    }

    /// Redeliveries filtered so far.
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    fn duplicate(&mut self) -> Delivery {
        self.duplicates += 1;
        Delivery::Duplicate
    }
}
