//! Block-related types.
pub mod store;

/// Time types, re-exported for use in block timestamps and timeouts.
pub mod time {
    pub use finney_net::time::{Clock, LocalDuration, LocalTime, RefClock};
}

pub use bitcoin::blockdata::block::{Block, BlockHeader};
pub use bitcoin::hash_types::BlockHash;

/// Height of a block in the chain.
pub type Height = u64;

/// A block timestamp, in seconds since the epoch.
pub type BlockTime = u32;
