//! Round event fan-out.
//!
//! Transport and websocket layers subscribe for round notifications.
//! Delivery is best-effort and non-blocking: a send with no live receivers
//! is dropped, and nothing a consumer does can reach back into the
//! transaction that produced the event.

use karst_types::{BlockId, Height, RoundId};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

const DEFAULT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RoundEvent {
    /// A round settled at its last block.
    FinishRound { round: RoundId },
    /// A block's round-level effects were reverted.
    BackwardTick { height: Height, id: BlockId },
    /// Real-time `rounds/change` notification for external channels.
    RoundChanged { number: RoundId },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RoundEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoundEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to whoever is listening right now.
    pub fn emit(&self, event: RoundEvent) {
        if self.sender.send(event).is_err() {
            debug!(target: "rounds", "round event dropped, no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
