//! Block body acquisition.
//!
//! The manager never waits on a body: a missing one defers the reorg and
//! the ingest collaborator kicks the manager again once the body arrives.

use async_trait::async_trait;
use dashmap::DashMap;

use karst_core::error::KarstError;
use karst_core::types::{Block, Hash256};

/// Source of block bodies. `Ok(None)` means not available yet.
#[async_trait]
pub trait BlockBodyProvider: Send + Sync {
    async fn fetch(&self, hash: &Hash256) -> Result<Option<Block>, KarstError>;
}

/// Bodies handed to the node by the ingest collaborator, held in memory
/// until applied (and retained for unwinding).
#[derive(Default)]
pub struct StagedBlocks {
    blocks: DashMap<Hash256, Block>,
}

impl StagedBlocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a body under its header hash.
    pub fn insert(&self, block: Block) -> Hash256 {
        let hash = block.header.hash();
        self.blocks.insert(hash, block);
        hash
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.blocks.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[async_trait]
impl BlockBodyProvider for StagedBlocks {
    async fn fetch(&self, hash: &Hash256) -> Result<Option<Block>, KarstError> {
        Ok(self.blocks.get(hash).map(|entry| entry.value().clone()))
    }
}
