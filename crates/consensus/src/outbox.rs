//! Outbound queue drained by the embedding agent.

use std::collections::VecDeque;

use bdls_types::Identity;

/// Where an outbound envelope should be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Deliver to every participant.
    Broadcast,
    /// Deliver to a single participant.
    Unicast(Identity),
}

/// FIFO of signed envelopes awaiting pickup.
///
/// Consecutive byte-identical broadcasts are suppressed; unicasts always go
/// through since their targets differ in intent even when bytes repeat.
#[derive(Debug, Default)]
pub(crate) struct Outbox {
    queue: VecDeque<(Destination, Vec<u8>)>,
    last_broadcast: Option<Vec<u8>>,
}

impl Outbox {
    pub fn push(&mut self, destination: Destination, bytes: Vec<u8>) {
        if destination == Destination::Broadcast {
            if self.last_broadcast.as_deref() == Some(bytes.as_slice()) {
                return;
            }
            self.last_broadcast = Some(bytes.clone());
        }
        self.queue.push_back((destination, bytes));
    }

    pub fn drain(&mut self) -> Vec<(Destination, Vec<u8>)> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}
