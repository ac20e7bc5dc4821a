//! # karst-chain
//! Header chain bookkeeping: the append-only chain index, materialized
//! chains, greatest-work target selection, the invalid-block cache, and the
//! event bus that ties the daemons together without back-references.

pub mod chain;
pub mod events;
pub mod index;
pub mod invalid;
pub mod selector;

pub use chain::{Chain, ReorgPlan};
pub use events::{CoreEvent, EventBus};
pub use index::ChainIndex;
pub use invalid::InvalidBlockCache;
pub use selector::TargetChainSelector;
