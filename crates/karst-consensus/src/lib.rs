//! # karst-consensus
//! The block validation pipeline and whole-block contextual checks.

pub mod block_validation;
pub mod pipeline;

pub use block_validation::{bip34_height_push, post_validate, resolve_block};
pub use pipeline::{BlockContext, BlockTotals, BlockValidator, PipelineConfig};
