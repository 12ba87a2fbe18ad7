//! Peer-to-peer types shared across crates.
pub mod peer;
