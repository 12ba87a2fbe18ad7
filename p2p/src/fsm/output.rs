//! State machine output queue.
//!
//! Sub-managers don't talk to the network directly; they push [`Io`]
//! entries into their outbox, and the reactor drains them through the
//! state machine's iterator.
use std::collections::VecDeque;

use log::*;

use finney_common::bitcoin::network::address::Address;
use finney_common::bitcoin::network::message::NetworkMessage;
use finney_common::bitcoin::network::message_blockdata::{GetHeadersMessage, Inventory};
use finney_common::bitcoin::network::message_network::VersionMessage;
use finney_common::block::BlockHash;
use finney_common::block::BlockTime;
use finney_net::time::LocalDuration;

use super::event::Event;
use super::{DisconnectReason, Locators, PeerId};

/// Output of a state transition, before the network frame is applied.
#[derive(Debug, Clone)]
pub enum Io {
    /// Send a message to a peer.
    Write(PeerId, NetworkMessage),
    /// Establish an outbound connection.
    Connect(PeerId),
    /// Close a peer connection.
    Disconnect(PeerId, DisconnectReason),
    /// Ask for a wake-up after the given duration.
    SetTimer(LocalDuration),
    /// Emit an event.
    Event(Event),
}

/// Queue of pending state machine outputs.
#[derive(Debug, Clone, Default)]
pub struct Outbox {
    queue: VecDeque<Io>,
}

impl Iterator for Outbox {
    type Item = Io;

    fn next(&mut self) -> Option<Io> {
        self.queue.pop_front()
    }
}

impl Outbox {
    /// Push an output to the queue.
    pub fn push(&mut self, output: Io) {
        self.queue.push_back(output);
    }

    /// Queue a message to be sent to a peer.
    pub fn message(&mut self, addr: PeerId, message: NetworkMessage) -> &mut Self {
        trace!(target: "p2p", "{}: Queueing `{}`", addr, message.cmd());

        self.push(Io::Write(addr, message));
        self
    }

    /// Notify subscribers of an event.
    pub fn event(&mut self, event: Event) {
        self.push(Io::Event(event));
    }

    /// Ask the reactor to dial an address.
    pub fn connect(&mut self, addr: PeerId) {
        self.push(Io::Connect(addr));
    }

    /// Ask the reactor to close a peer connection.
    pub fn disconnect(&mut self, addr: PeerId, reason: DisconnectReason) {
        self.push(Io::Disconnect(addr, reason));
    }

    /// Ask the reactor for a wake-up call.
    pub fn set_timer(&mut self, duration: LocalDuration) -> &mut Self {
        self.push(Io::SetTimer(duration));
        self
    }

    /// Send our `version` message.
    pub fn version(&mut self, addr: PeerId, version: VersionMessage) -> &mut Self {
        self.message(addr, NetworkMessage::Version(version))
    }

    /// Send a `verack` message.
    pub fn verack(&mut self, addr: PeerId) -> &mut Self {
        self.message(addr, NetworkMessage::Verack)
    }

    /// Send a `ping` message.
    pub fn ping(&mut self, addr: PeerId, nonce: u64) -> &mut Self {
        self.message(addr, NetworkMessage::Ping(nonce))
    }

    /// Send a `pong` message.
    pub fn pong(&mut self, addr: PeerId, nonce: u64) -> &mut Self {
        self.message(addr, NetworkMessage::Pong(nonce))
    }

    /// Send a `getaddr` message.
    pub fn get_addr(&mut self, addr: PeerId) {
        self.message(addr, NetworkMessage::GetAddr);
    }

    /// Send an `addr` message.
    pub fn addr(&mut self, addr: PeerId, addrs: Vec<(BlockTime, Address)>) {
        self.message(addr, NetworkMessage::Addr(addrs));
    }

    /// Send a `getheaders` message.
    pub fn get_headers(&mut self, addr: PeerId, (locator_hashes, stop_hash): Locators, version: u32) {
        self.message(
            addr,
            NetworkMessage::GetHeaders(GetHeadersMessage {
                version,
                locator_hashes,
                stop_hash,
            }),
        );
    }

    /// Send a `getdata` message for a single block.
    pub fn get_block(&mut self, addr: PeerId, hash: BlockHash) {
        self.message(addr, NetworkMessage::GetData(vec![Inventory::Block(hash)]));
    }
}
