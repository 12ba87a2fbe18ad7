//! Ping manager.
//!
//! Measures peer round-trip latency and answers peer `ping` messages.
//! Latency samples are kept in a bounded ring per peer; a peer whose ring is
//! full is considered fully tested, and its average is pushed onto the
//! candidate registry. Unanswered pings are folded in as synthetic samples
//! so that a stuck peer's score decays instead of the ping queue growing.
//!
//! *Implementation of BIP 0031.*
use std::collections::{HashMap, VecDeque};

use log::*;

use finney_common::bitcoin::network::message::NetworkMessage;
use finney_common::block::time::{Clock, LocalDuration, LocalTime};

use super::event::Event;
use super::output::{Io, Outbox};
use super::PeerId;

/// Number of samples in the latency ring.
pub const LATENCY_RING_SIZE: usize = 8;

#[derive(Debug)]
enum State {
    /// A ping was sent and no matching pong has arrived. `since` is set on
    /// enqueue and restamped when the write completes, so latency reflects
    /// wire time.
    AwaitingPong { nonce: u64, since: LocalTime },
    /// The last ping was answered at the given time.
    Idle { since: LocalTime },
}

/// Per-peer ping state.
#[derive(Debug)]
pub struct Peer {
    address: PeerId,
    state: State,
    /// Observed round-trip latencies for this peer.
    latencies: VecDeque<LocalDuration>,
}

impl Peer {
    /// Mean of the recorded latency samples, zero if none were recorded.
    pub fn latency(&self) -> LocalDuration {
        if self.latencies.is_empty() {
            return LocalDuration::ZERO;
        }
        let sum: LocalDuration = self.latencies.iter().sum();

        sum / self.latencies.len() as u32
    }

    /// Whether the latency ring is full.
    pub fn is_fully_tested(&self) -> bool {
        self.latencies.len() >= LATENCY_RING_SIZE
    }

    fn record_latency(&mut self, sample: LocalDuration) {
        self.latencies.push_front(sample);
        self.latencies.truncate(LATENCY_RING_SIZE);
    }
}

/// Measures latencies and detects dead peer connections.
#[derive(Debug)]
pub struct PingManager<C> {
    peers: HashMap<PeerId, Peer>,
    rng: fastrand::Rng,
    outbox: Outbox,
    clock: C,
}

impl<C> Iterator for PingManager<C> {
    type Item = Io;

    fn next(&mut self) -> Option<Self::Item> {
        self.outbox.next()
    }
}

impl<C: Clock> PingManager<C> {
    /// Create a new ping manager.
    pub fn new(rng: fastrand::Rng, clock: C) -> Self {
        Self {
            peers: HashMap::new(),
            rng,
            outbox: Outbox::default(),
            clock,
        }
    }

    /// Event received.
    pub fn received_event(&mut self, event: Event) {
        match event {
            Event::Negotiated { addr, .. } => {
                self.peer_negotiated(addr);
            }
            Event::Disconnected { addr, .. } => {
                self.peers.remove(&addr);
            }
            Event::MessageSent { to, command } => {
                if command == "ping" {
                    self.ping_sent(to);
                }
            }
            Event::MessageReceived { from, message } => match message.as_ref() {
                NetworkMessage::Ping(nonce) => {
                    self.received_ping(from, *nonce);
                }
                NetworkMessage::Pong(nonce) => {
                    self.received_pong(from, *nonce);
                }
                _ => {}
            },
            _ => {}
        }
    }

    /// Called when a peer completes its handshake: sends the initial ping.
    fn peer_negotiated(&mut self, address: PeerId) {
        let nonce = self.rng.u64(..);
        let now = self.clock.local_time();

        self.outbox.ping(address, nonce);
        self.peers.insert(
            address,
            Peer {
                address,
                state: State::AwaitingPong { nonce, since: now },
                latencies: VecDeque::new(),
            },
        );
    }

    /// A queued ping finished writing; restamp the send time so the next
    /// pong measures wire latency rather than queue latency.
    fn ping_sent(&mut self, addr: PeerId) {
        let now = self.clock.local_time();

        if let Some(peer) = self.peers.get_mut(&addr) {
            if let State::AwaitingPong { since, .. } = &mut peer.state {
                *since = now;
            }
        }
    }

    /// The periodic ping task. An outstanding unanswered ping is folded in
    /// as a synthetic sample before a fresh nonce goes out.
    pub fn ping_peers(&mut self) {
        let now = self.clock.local_time();

        for peer in self.peers.values_mut() {
            if let State::AwaitingPong { since, nonce } = peer.state {
                peer.record_latency(now - since);
                trace!(
                    target: "p2p",
                    "{}: No `pong` for nonce {}, recording synthetic latency",
                    peer.address,
                    nonce
                );
            }
            let nonce = self.rng.u64(..);

            self.outbox.ping(peer.address, nonce);
            peer.state = State::AwaitingPong { nonce, since: now };
        }
    }

    /// Called when a `ping` is received.
    fn received_ping(&mut self, addr: PeerId, nonce: u64) {
        if self.peers.contains_key(&addr) {
            self.outbox.pong(addr, nonce);
        }
    }

    /// Called when a `pong` is received. A stale nonce neither updates the
    /// latency ring nor clears the pending ping.
    fn received_pong(&mut self, addr: PeerId, nonce: u64) {
        let now = self.clock.local_time();

        if let Some(peer) = self.peers.get_mut(&addr) {
            match peer.state {
                State::AwaitingPong {
                    nonce: last_nonce,
                    since,
                } => {
                    if nonce == last_nonce {
                        peer.record_latency(now - since);
                        peer.state = State::Idle { since: now };

                        if peer.is_fully_tested() {
                            self.outbox.event(Event::PeerLatency {
                                addr,
                                average: peer.latency(),
                            });
                        }
                    } else {
                        debug!(
                            target: "p2p",
                            "{}: Ignoring `pong` with stale nonce {}", addr, nonce
                        );
                    }
                }
                // Unsolicited or redundant `pong`. Ignore.
                State::Idle { .. } => {}
            }
        }
    }

    /// Latency of a peer, if it has been measured.
    pub fn latency(&self, addr: &PeerId) -> Option<LocalDuration> {
        self.peers
            .get(addr)
            .filter(|p| !p.latencies.is_empty())
            .map(Peer::latency)
    }

    /// Whether a peer's latency ring is full.
    pub fn is_fully_tested(&self, addr: &PeerId) -> bool {
        self.peers.get(addr).map_or(false, Peer::is_fully_tested)
    }
}
