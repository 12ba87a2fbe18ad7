//! Chain store interface.
//!
//! Header and block validation, persistence and fetch prioritization are the
//! chain store's business; the networking engine only needs the operations
//! below. A real store lives in its own process component, [`model`] provides
//! an in-memory stand-in.
use thiserror::Error;

use crate::block::{Block, BlockHash, BlockHeader, Height};

pub mod model;

/// An error coming from the chain store.
#[derive(Debug, Error)]
pub enum Error {
    /// A storage error occured.
    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),
    /// Mismatched genesis.
    #[error("stored genesis header doesn't match network genesis")]
    GenesisMismatch,
}

/// Outcome of submitting a header to the store.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HeaderStatus {
    /// The header extended the active chain.
    New,
    /// The header was already known.
    Existed,
    /// The header was rejected by the store.
    Invalid,
    /// The header doesn't connect to anything we know.
    Orphan,
}

/// Outcome of submitting a block to the store.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BlockStatus {
    /// The block was accepted.
    New,
    /// The block was already present.
    Existed,
    /// The block was rejected by the store.
    Invalid,
    /// No header is known for this block.
    Orphan,
}

/// The chain store, as seen from the networking engine.
pub trait ChainStore {
    /// The current tip of the active header chain.
    fn tip(&self) -> (BlockHash, Height);

    /// Highest height for which all blocks from genesis are present.
    fn max_full_block_height(&self) -> Height;

    /// Up to `limit` block hashes we still want, prioritized by the store.
    fn missing_blocks(&self, limit: usize) -> Vec<BlockHash>;

    /// Submit a header received from the network.
    fn submit_header(&mut self, header: BlockHeader) -> HeaderStatus;

    /// Submit a full block received from the network.
    fn submit_block(&mut self, block: &Block) -> BlockStatus;

    /// Persist chain state.
    fn save(&mut self) -> Result<(), Error>;
}
