//! Typed event bus.
//!
//! Daemons that would otherwise observe each other directly (the selector
//! watches the invalid-block cache, the mempool watches the chain state
//! manager) subscribe here instead, holding only the bus and a receiver.

use tokio::sync::broadcast;

use karst_core::types::{BlockHeader, Hash256};

/// Everything the core announces to the outside world and to itself.
#[derive(Clone, Debug)]
pub enum CoreEvent {
    /// The best-work valid header changed.
    TargetBlockChanged { hash: Hash256, height: u32 },
    /// The target chain was republished (tip or ancestry changed).
    TargetChainChanged { tip: Hash256, height: u32 },
    /// The chain state manager finished moving the active tip.
    ChainTipAdvanced { tip: Hash256, height: u32 },
    BlockApplied { header: BlockHeader, height: u32 },
    BlockUnwound { header: BlockHeader, height: u32 },
    TxAdded { txid: Hash256 },
    TxesConfirmed {
        block: Hash256,
        confirmed: Vec<Hash256>,
        /// Pool transactions evicted because the block spent their inputs.
        conflicted: Vec<Hash256>,
    },
    TxesUnconfirmed {
        block: Hash256,
        /// Candidates for re-admission; the subscriber re-offers them.
        unconfirmed: Vec<Hash256>,
    },
    BlockInvalidated { hash: Hash256, reason: String },
}

/// Broadcast bus; publishing never blocks and tolerates zero subscribers.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: CoreEvent) {
        // A send error only means nobody is listening right now.
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
