//! Block and header synchronization.
//!
//! Drives `getheaders`/`getdata` against the chain store. Every hand-shaken
//! peer carries at most one outstanding block request at a time; the
//! protocol is therefore self-limiting and needs no request queue.
use std::collections::HashMap;

use log::*;

use finney_common::bitcoin::hashes::Hash as _;
use finney_common::bitcoin::network::message::NetworkMessage;
use finney_common::block::store::{BlockStatus, ChainStore, HeaderStatus};
use finney_common::block::time::Clock;
use finney_common::block::{Block, BlockHash, BlockHeader, Height};

use super::event::Event;
use super::output::{Io, Outbox};
use super::PeerId;

/// Sync manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Protocol version placed in `getheaders` requests.
    pub protocol_version: u32,
}

/// Manages block and header requests.
#[derive(Debug)]
pub struct SyncManager<C> {
    /// The one outstanding block request per peer, if any.
    requesting: HashMap<PeerId, BlockHash>,
    config: Config,
    outbox: Outbox,
    clock: C,
}

impl<C> Iterator for SyncManager<C> {
    type Item = Io;

    fn next(&mut self) -> Option<Self::Item> {
        self.outbox.next()
    }
}

impl<C: Clock> SyncManager<C> {
    /// Create a new sync manager.
    pub fn new(config: Config, clock: C) -> Self {
        Self {
            requesting: HashMap::new(),
            config,
            outbox: Outbox::default(),
            clock,
        }
    }

    /// Event received.
    pub fn received_event<T: ChainStore>(&mut self, event: Event, chain: &mut T) {
        match event {
            Event::Disconnected { addr, .. } => {
                self.requesting.remove(&addr);
            }
            Event::MessageReceived { from, message } => match message.as_ref() {
                NetworkMessage::Headers(headers) => {
                    self.received_headers(from, headers, chain);
                }
                NetworkMessage::Block(block) => {
                    self.received_block(from, block, chain);
                }
                NetworkMessage::Inv(_) => {
                    // Announcements are not acted upon; block download is
                    // driven by the chain store's missing set. Extension
                    // point for inv-based relay.
                }
                _ => {}
            },
            _ => {}
        }
    }

    /// The periodic data exchange: ask peers that are ahead of us for
    /// headers, and hand each idle peer one missing block to fetch.
    pub fn exchange_data<T, I>(&mut self, chain: &T, peers: I)
    where
        T: ChainStore,
        I: Iterator<Item = (PeerId, Height)>,
    {
        let peers = peers.collect::<Vec<_>>();
        let idle = peers
            .iter()
            .filter(|(addr, _)| !self.requesting.contains_key(addr))
            .map(|(addr, _)| *addr)
            .collect::<Vec<_>>();
        let mut wanted = chain.missing_blocks(idle.len()).into_iter();
        let (tip_hash, tip_height) = chain.tip();

        for (addr, height) in &peers {
            if *height > tip_height {
                self.outbox.get_headers(
                    *addr,
                    (vec![tip_hash], BlockHash::all_zeros()),
                    self.config.protocol_version,
                );
            }
            if idle.contains(addr) {
                if let Some(hash) = wanted.next() {
                    trace!(target: "p2p", "{}: Requesting block {}", addr, hash);

                    self.outbox.get_block(*addr, hash);
                    self.requesting.insert(*addr, hash);
                }
            }
        }
    }

    /// Called when a `headers` message was received.
    fn received_headers<T: ChainStore>(
        &mut self,
        from: PeerId,
        headers: &[BlockHeader],
        chain: &mut T,
    ) {
        if headers.is_empty() {
            return;
        }
        let mut new = 0;
        let mut existed = 0;
        let mut rejected = 0;

        for header in headers {
            match chain.submit_header(*header) {
                HeaderStatus::New => new += 1,
                HeaderStatus::Existed => existed += 1,
                HeaderStatus::Invalid | HeaderStatus::Orphan => rejected += 1,
            }
        }
        info!(
            target: "p2p",
            "{}: Received {} header(s): {} new, {} known, {} rejected, height = {}",
            from,
            headers.len(),
            new,
            existed,
            rejected,
            chain.tip().1,
        );
    }

    /// Called when a `block` message was received. Clears the peer's
    /// outstanding request when the block matches it.
    fn received_block<T: ChainStore>(&mut self, from: PeerId, block: &Block, chain: &mut T) {
        let hash = block.block_hash();
        let status = chain.submit_block(block);

        match self.requesting.get(&from) {
            Some(requested) if *requested == hash => {
                self.requesting.remove(&from);

                debug!(
                    target: "p2p",
                    "{}: Received requested block {} ({:?})", from, hash, status
                );
            }
            _ => {
                debug!(
                    target: "p2p",
                    "{}: Received unsolicited block {} ({:?})", from, hash, status
                );
            }
        }
        if status == BlockStatus::New {
            trace!(
                target: "p2p",
                "Blocks contiguous up to height {} at {}",
                chain.max_full_block_height(),
                self.clock.local_time(),
            );
        }
    }

    /// The block a peer is currently fetching, if any.
    pub fn requesting(&self, addr: &PeerId) -> Option<&BlockHash> {
        self.requesting.get(addr)
    }

    /// Number of outstanding block requests across all peers.
    pub fn in_flight(&self) -> usize {
        self.requesting.len()
    }
}
