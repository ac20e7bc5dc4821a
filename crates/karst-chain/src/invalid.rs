//! Durable blacklist of blocks that failed validation.
//!
//! The selector consults it to skip poisoned branches; additions are
//! announced on the bus so the selector can schedule a rescan without
//! holding a reference back to the cache's writers.

use std::sync::Arc;

use dashmap::DashMap;

use karst_core::error::KarstError;
use karst_core::store::InvalidBlockStore;
use karst_core::types::Hash256;

use crate::events::{CoreEvent, EventBus};

pub struct InvalidBlockCache {
    blocks: DashMap<Hash256, String>,
    store: Arc<dyn InvalidBlockStore>,
    events: EventBus,
}

impl InvalidBlockCache {
    /// Open the cache, reloading previously persisted entries.
    pub fn open(store: Arc<dyn InvalidBlockStore>, events: EventBus) -> Result<Self, KarstError> {
        let blocks = DashMap::new();
        for (hash, reason) in store.load_all()? {
            blocks.insert(hash, reason);
        }
        Ok(Self { blocks, store, events })
    }

    /// Blacklist a block. Idempotent; only the first addition persists and
    /// fires [`CoreEvent::BlockInvalidated`].
    pub fn add(&self, hash: Hash256, reason: impl Into<String>) -> Result<(), KarstError> {
        let reason = reason.into();
        if self.blocks.contains_key(&hash) {
            return Ok(());
        }
        self.store.put(&hash, &reason)?;
        self.blocks.insert(hash, reason.clone());
        tracing::warn!(block = %hash, %reason, "block blacklisted");
        self.events.publish(CoreEvent::BlockInvalidated { hash, reason });
        Ok(())
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.blocks.contains_key(hash)
    }

    pub fn reason(&self, hash: &Hash256) -> Option<String> {
        self.blocks.get(hash).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
