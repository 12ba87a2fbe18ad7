//! In-memory chain model.
//!
//! Implements [`ChainStore`] over a simple header list, without validating
//! proof-of-work or difficulty. Used as the default store of the daemon until
//! a real chain component is wired in, and by the protocol tests.
use std::collections::{BTreeSet, HashMap};

use nonempty::NonEmpty;

use crate::block::store::{BlockStatus, ChainStore, Error, HeaderStatus};
use crate::block::{Block, BlockHash, BlockHeader, Height};

/// An in-memory chain of headers and blocks.
#[derive(Debug, Clone)]
pub struct ChainModel {
    /// Active chain, indexed by height. The head is the genesis header.
    headers: NonEmpty<BlockHeader>,
    /// Height of every known header hash.
    heights: HashMap<BlockHash, Height>,
    /// Heights for which the full block is present.
    blocks: BTreeSet<Height>,
}

impl ChainModel {
    /// Create a chain model containing only the genesis header.
    pub fn new(genesis: BlockHeader) -> Self {
        let mut heights = HashMap::new();
        heights.insert(genesis.block_hash(), 0);

        let mut blocks = BTreeSet::new();
        blocks.insert(0);

        Self {
            headers: NonEmpty::new(genesis),
            heights,
            blocks,
        }
    }

    /// Height of the best known header.
    pub fn height(&self) -> Height {
        self.headers.len() as Height - 1
    }

    /// Get a header of the active chain by height.
    pub fn get_header(&self, height: Height) -> Option<&BlockHeader> {
        self.headers.get(height as usize)
    }
}

impl ChainStore for ChainModel {
    fn tip(&self) -> (BlockHash, Height) {
        (self.headers.last().block_hash(), self.height())
    }

    fn max_full_block_height(&self) -> Height {
        let mut height = 0;
        while self.blocks.contains(&(height + 1)) {
            height += 1;
        }
        height
    }

    fn missing_blocks(&self, limit: usize) -> Vec<BlockHash> {
        (1..=self.height())
            .filter(|h| !self.blocks.contains(h))
            .take(limit)
            .filter_map(|h| self.headers.get(h as usize).map(|h| h.block_hash()))
            .collect()
    }

    fn submit_header(&mut self, header: BlockHeader) -> HeaderStatus {
        let hash = header.block_hash();

        if self.heights.contains_key(&hash) {
            HeaderStatus::Existed
        } else if header.prev_blockhash == self.headers.last().block_hash() {
            self.headers.push(header);
            self.heights.insert(hash, self.height());

            HeaderStatus::New
        } else {
            HeaderStatus::Orphan
        }
    }

    fn submit_block(&mut self, block: &Block) -> BlockStatus {
        let hash = block.block_hash();

        match self.heights.get(&hash) {
            None => BlockStatus::Orphan,
            Some(height) if self.blocks.contains(height) => BlockStatus::Existed,
            Some(height) => {
                self.blocks.insert(*height);

                BlockStatus::New
            }
        }
    }

    fn save(&mut self) -> Result<(), Error> {
        // Nothing to persist in memory.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn genesis() -> BlockHeader {
        bitcoin::blockdata::constants::genesis_block(bitcoin::Network::Regtest)
            .header
    }

    /// Build a header extending the given parent. The contents don't matter
    /// to the model, only the linkage.
    fn header(prev: &BlockHeader, nonce: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_blockhash: prev.block_hash(),
            merkle_root: prev.merkle_root,
            time: prev.time + 600,
            bits: prev.bits,
            nonce,
        }
    }

    #[test]
    fn test_submit_headers() {
        let mut chain = ChainModel::new(genesis());
        let h1 = header(&genesis(), 1);
        let h2 = header(&h1, 2);

        assert_eq!(chain.submit_header(h1), HeaderStatus::New);
        assert_eq!(chain.submit_header(h1), HeaderStatus::Existed);
        assert_eq!(chain.submit_header(h2), HeaderStatus::New);
        assert_eq!(chain.height(), 2);
        assert_eq!(chain.tip().0, h2.block_hash());

        let orphan = header(&header(&h2, 9), 3);
        assert_eq!(chain.submit_header(orphan), HeaderStatus::Orphan);
    }

    #[test]
    fn test_missing_and_full_height() {
        let mut chain = ChainModel::new(genesis());
        let h1 = header(&genesis(), 1);
        let h2 = header(&h1, 2);
        let h3 = header(&h2, 3);

        for h in [h1, h2, h3] {
            chain.submit_header(h);
        }
        assert_eq!(chain.max_full_block_height(), 0);
        assert_eq!(
            chain.missing_blocks(16),
            vec![h1.block_hash(), h2.block_hash(), h3.block_hash()]
        );
        assert_eq!(chain.missing_blocks(1), vec![h1.block_hash()]);

        let b1 = Block { header: h1, txdata: vec![] };
        assert_eq!(chain.submit_block(&b1), BlockStatus::New);
        assert_eq!(chain.submit_block(&b1), BlockStatus::Existed);
        assert_eq!(chain.max_full_block_height(), 1);

        let b3 = Block { header: h3, txdata: vec![] };
        assert_eq!(chain.submit_block(&b3), BlockStatus::New);
        // Height 2 is still missing, so the contiguous prefix ends at 1.
        assert_eq!(chain.max_full_block_height(), 1);
        assert_eq!(chain.missing_blocks(16), vec![h2.block_hash()]);
    }
}
