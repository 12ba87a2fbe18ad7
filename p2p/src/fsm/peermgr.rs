//! Peer slot and connection management.
//!
//! Outbound connections live in a fixed arena of slots. A slot is bound to a
//! candidate from the address registry, dialed, walked through the version
//! handshake and finally replaced: closing the socket and dialing a fresh
//! candidate into the same slot index is the single recycle path that every
//! timeout and error funnels through. Callbacks are keyed by peer address,
//! and a candidate is bound to at most one slot, so a callback arriving
//! after its slot was recycled no longer matches any slot and no-ops.
use std::net;

use log::*;

use finney_common::bitcoin::network::address::Address;
use finney_common::bitcoin::network::constants::ServiceFlags;
use finney_common::bitcoin::network::message::NetworkMessage;
use finney_common::bitcoin::network::message_network::VersionMessage;
use finney_common::block::store::ChainStore;
use finney_common::block::time::{Clock, LocalDuration, LocalTime};
use finney_common::block::Height;
use finney_common::p2p::peer::Store;
use finney_net::{Disconnect, Link};

use super::addrmgr::AddressManager;
use super::event::Event;
use super::output::{Io, Outbox};
use super::{DisconnectReason, PeerId};

/// Handshake progress, tracked independently per direction.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Their `verack` arrived.
    pub they_accepted_us: bool,
    /// Their `version` met our minimum.
    pub we_accept_them: bool,
}

impl Handshake {
    /// The peer is hand-shaken when both directions have accepted.
    pub fn is_complete(&self) -> bool {
        self.they_accepted_us && self.we_accept_them
    }
}

/// An established peer connection.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Remote peer address.
    pub addr: PeerId,
    /// Local socket address.
    pub local_addr: net::SocketAddr,
    /// Connection direction.
    pub link: Link,
    /// When the connection was established.
    pub since: LocalTime,
    /// When our `version` went out; the handshake timeout counts from here.
    pub handshake_start: LocalTime,
    /// When we last heard anything from this peer.
    pub last_heard: LocalTime,
    /// Handshake progress.
    pub handshake: Handshake,
    /// Nonce we sent in our `version`, to detect self-connections.
    our_nonce: u64,
}

/// Protocol information learned from the peer's `version` message.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// Protocol version advertised by the peer.
    pub version: u32,
    /// Services advertised by the peer.
    pub services: ServiceFlags,
    /// Chain-height hint from the peer's `version`.
    pub height: Height,
    /// The peer's user agent.
    pub user_agent: String,
}

/// State of a peer slot.
#[derive(Debug, Clone)]
pub enum SlotState {
    /// No connection and no candidate bound.
    Empty,
    /// A TCP connection to the bound candidate is being established.
    Dialing {
        /// The candidate being dialed.
        addr: PeerId,
        /// When the dial started.
        since: LocalTime,
    },
    /// The connection is established; hand-shaken once `peer` is known and
    /// both handshake booleans are set.
    Connected {
        /// The connection.
        conn: Connection,
        /// Set when the peer's `version` was received.
        peer: Option<PeerInfo>,
    },
    /// The socket is being closed; the slot is recycled when the close
    /// completes.
    Closing {
        /// The departing peer.
        addr: PeerId,
    },
}

/// A peer slot.
#[derive(Debug, Clone)]
pub struct Slot {
    /// Position in the arena; never changes.
    pub index: usize,
    /// Current occupant.
    pub state: SlotState,
}

impl Slot {
    /// Address currently associated with this slot, in any state.
    pub fn addr(&self) -> Option<PeerId> {
        match &self.state {
            SlotState::Empty => None,
            SlotState::Dialing { addr, .. } => Some(*addr),
            SlotState::Connected { conn, .. } => Some(conn.addr),
            SlotState::Closing { addr } => Some(*addr),
        }
    }

    /// Whether the slot holds a hand-shaken peer.
    pub fn is_ready(&self) -> bool {
        matches!(
            &self.state,
            SlotState::Connected { conn, peer: Some(_) } if conn.handshake.is_complete()
        )
    }
}

/// Peer manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Protocol version we advertise.
    pub protocol_version: u32,
    /// Lowest remote protocol version we accept.
    pub minimal_peer_version: u32,
    /// Services we advertise.
    pub services: ServiceFlags,
    /// Our user agent.
    pub user_agent: &'static str,
    /// Peer slot count outside initial block download.
    pub max_outgoing: usize,
    /// Peer slot count during initial block download.
    pub max_outgoing_ibd: usize,
    /// Candidate count below which a fresh handshake triggers `getaddr`.
    pub getaddr_threshold: usize,
    /// Time allowed to reach the hand-shaken state.
    pub handshake_timeout: LocalDuration,
    /// Maximum age of a connection before it is recycled, if set.
    pub peer_life: Option<LocalDuration>,
}

/// Manages peer slots, the handshake and connection replacement.
#[derive(Debug)]
pub struct PeerManager<C> {
    /// Peer manager configuration.
    pub config: Config,
    slots: Vec<Slot>,
    ibd: bool,
    rng: fastrand::Rng,
    outbox: Outbox,
    clock: C,
}

impl<C> Iterator for PeerManager<C> {
    type Item = Io;

    fn next(&mut self) -> Option<Io> {
        self.outbox.next()
    }
}

impl<C: Clock> PeerManager<C> {
    /// Create a new peer manager.
    pub fn new(config: Config, rng: fastrand::Rng, clock: C) -> Self {
        let capacity = config.max_outgoing.max(config.max_outgoing_ibd);
        let slots = (0..capacity)
            .map(|index| Slot {
                index,
                state: SlotState::Empty,
            })
            .collect();

        Self {
            config,
            slots,
            ibd: false,
            rng,
            outbox: Outbox::default(),
            clock,
        }
    }

    /// Bind and dial candidates into all open slots. Must be called once.
    pub fn initialize<P: Store>(&mut self, addrmgr: &mut AddressManager<P, C>) {
        self.maintain_slots(addrmgr);
    }

    /// Number of slots in use for the current mode.
    pub fn target_slots(&self) -> usize {
        if self.ibd {
            self.config.max_outgoing_ibd
        } else {
            self.config.max_outgoing
        }
    }

    /// Whether the manager is in initial block download mode.
    pub fn is_ibd(&self) -> bool {
        self.ibd
    }

    /// Switch initial-block-download mode, resizing the active slot range.
    pub fn set_ibd<P: Store>(&mut self, ibd: bool, addrmgr: &mut AddressManager<P, C>) {
        if self.ibd != ibd {
            self.ibd = ibd;
            self.maintain_slots(addrmgr);
        }
    }

    /// Event received.
    pub fn received_event<T: ChainStore, P: Store>(
        &mut self,
        event: Event,
        addrmgr: &mut AddressManager<P, C>,
        chain: &T,
    ) {
        match event {
            Event::MessageReceived { from, message } => {
                let now = self.clock.local_time();

                if let Some(slot) = self.slot_by_addr_mut(&from) {
                    if let SlotState::Connected { conn, .. } = &mut slot.state {
                        conn.last_heard = now;
                    }
                }
                match message.as_ref() {
                    NetworkMessage::Version(version) => {
                        self.received_version(&from, version.clone(), addrmgr, chain);
                    }
                    NetworkMessage::Verack => {
                        self.received_verack(&from, addrmgr, chain);
                    }
                    _ => {}
                }
            }
            Event::MessageSent { to, command } => {
                // Our `version` hit the wire; the handshake clock starts now.
                if command == "version" {
                    let now = self.clock.local_time();

                    if let Some(slot) = self.slot_by_addr_mut(&to) {
                        if let SlotState::Connected { conn, .. } = &mut slot.state {
                            conn.handshake_start = now;
                        }
                    }
                }
            }
            _ => {}
        }
    }

    /// Called when an outbound connection attempt was started.
    pub fn peer_attempted(&mut self, addr: &PeerId) {
        debug_assert!(self.is_dialing(addr), "{} is not being dialed", addr);
    }

    /// Called when a connection was established. Sends our `version`.
    pub fn peer_connected(
        &mut self,
        addr: PeerId,
        local_addr: net::SocketAddr,
        link: Link,
        height: Height,
    ) {
        debug_assert!(link.is_outbound(), "only outbound peers are dialed");

        let now = self.clock.local_time();
        let nonce = self.rng.u64(..);
        let version = self.version(addr, local_addr, nonce, height);

        if let Some(slot) = self
            .slots
            .iter_mut()
            .find(|s| matches!(&s.state, SlotState::Dialing { addr: a, .. } if *a == addr))
        {
            slot.state = SlotState::Connected {
                conn: Connection {
                    addr,
                    local_addr,
                    link,
                    since: now,
                    handshake_start: now,
                    last_heard: now,
                    handshake: Handshake::default(),
                    our_nonce: nonce,
                },
                peer: None,
            };
            self.outbox.version(addr, version);
            self.outbox.event(Event::Connected {
                addr,
                local_addr,
                link,
            });
        } else {
            debug!(target: "p2p", "{}: Connected with no slot dialing it", addr);
        }
    }

    /// Called when a connection was closed. This is the only path that
    /// recycles a slot: the close has completed, so the slot is freed and a
    /// fresh candidate is dialed into the same index.
    pub fn peer_disconnected<P: Store>(
        &mut self,
        addr: &PeerId,
        addrmgr: &mut AddressManager<P, C>,
        reason: Disconnect<DisconnectReason>,
    ) {
        let target = self.target_slots();
        let slot = match self.slot_by_addr_mut(addr) {
            Some(slot) => slot,
            None => {
                debug!(target: "p2p", "{}: Disconnected with no slot assigned", addr);
                return;
            }
        };
        // A dial that never completed points at a dead candidate.
        let failed_dial = matches!(&slot.state, SlotState::Dialing { .. });
        let index = slot.index;

        slot.state = SlotState::Empty;

        addrmgr.unbind(addr);
        if failed_dial {
            addrmgr.disable(addr);
        }
        self.outbox.event(Event::Disconnected {
            addr: *addr,
            reason,
        });

        // Dial failures wait for the next sweep to refill the slot, so a
        // registry of dead candidates can't turn into a dial spin.
        if index < target && !failed_dial {
            self.connect_to_best_candidate(index, addrmgr);
        }
    }

    /// The periodic connectivity sweep: handshake timeouts, expired peer
    /// lifetimes, and refilling or shrinking the slot range.
    pub fn check_connectivity<P: Store>(&mut self, addrmgr: &mut AddressManager<P, C>) {
        let now = self.clock.local_time();
        let mut timed_out: Vec<(usize, PeerId, DisconnectReason, bool)> = Vec::new();

        for slot in self.slots.iter() {
            match &slot.state {
                SlotState::Dialing { addr, since } => {
                    if now - *since >= self.config.handshake_timeout {
                        timed_out.push((
                            slot.index,
                            *addr,
                            DisconnectReason::PeerTimeout("connect"),
                            true,
                        ));
                    }
                }
                SlotState::Connected { conn, .. } if !conn.handshake.is_complete() => {
                    if now - conn.handshake_start >= self.config.handshake_timeout {
                        timed_out.push((
                            slot.index,
                            conn.addr,
                            DisconnectReason::PeerTimeout("handshake"),
                            true,
                        ));
                    }
                }
                SlotState::Connected { conn, .. } => {
                    if let Some(life) = self.config.peer_life {
                        // The candidate stays eligible for reuse.
                        if now - conn.since >= life {
                            timed_out.push((
                                slot.index,
                                conn.addr,
                                DisconnectReason::PeerLifetime,
                                false,
                            ));
                        }
                    }
                }
                _ => {}
            }
        }
        for (index, addr, reason, disable) in timed_out {
            if disable {
                addrmgr.disable(&addr);
            }
            self.disconnect_slot(index, reason);
        }
        self.maintain_slots(addrmgr);
    }

    /// Disconnect a peer by address.
    pub fn disconnect(&mut self, addr: PeerId, reason: DisconnectReason) {
        if let Some(index) = self
            .slots
            .iter()
            .find(|s| s.addr() == Some(addr))
            .map(|s| s.index)
        {
            self.disconnect_slot(index, reason);
        }
    }

    /// Close the slot's socket. Idempotent against slots already closing;
    /// the slot is recycled when the close completion arrives.
    fn disconnect_slot(&mut self, index: usize, reason: DisconnectReason) {
        let slot = &mut self.slots[index];

        match &slot.state {
            SlotState::Dialing { addr, .. } | SlotState::Connected {
                conn: Connection { addr, .. },
                ..
            } => {
                let addr = *addr;

                self.outbox.disconnect(addr, reason);
                slot.state = SlotState::Closing { addr };
            }
            SlotState::Closing { .. } | SlotState::Empty => {}
        }
    }

    /// Fill empty slots below the target with fresh candidates and close
    /// connections living in slots above it.
    fn maintain_slots<P: Store>(&mut self, addrmgr: &mut AddressManager<P, C>) {
        let target = self.target_slots();
        let mut refill = Vec::new();
        let mut surplus = Vec::new();

        for slot in self.slots.iter() {
            if slot.index < target {
                if matches!(slot.state, SlotState::Empty) {
                    refill.push(slot.index);
                }
            } else if !matches!(slot.state, SlotState::Empty | SlotState::Closing { .. }) {
                surplus.push(slot.index);
            }
        }
        for index in refill {
            self.connect_to_best_candidate(index, addrmgr);
        }
        for index in surplus {
            self.disconnect_slot(index, DisconnectReason::ConnectionLimit);
        }
    }

    /// Bind the best unbound candidate to the slot and dial it. With no
    /// candidate to bind, the slot stays empty until a later tick.
    fn connect_to_best_candidate<P: Store>(
        &mut self,
        index: usize,
        addrmgr: &mut AddressManager<P, C>,
    ) {
        match addrmgr.best_non_peer() {
            Some(addr) => self.dial_into_slot(index, addr, addrmgr),
            None => {
                debug!(
                    target: "p2p",
                    "No candidate available for slot #{}, deferring", index
                );
            }
        }
    }

    /// Reset the slot and start an asynchronous connect to the candidate.
    fn dial_into_slot<P: Store>(
        &mut self,
        index: usize,
        addr: PeerId,
        addrmgr: &mut AddressManager<P, C>,
    ) {
        let now = self.clock.local_time();
        let slot = &mut self.slots[index];

        debug_assert!(matches!(slot.state, SlotState::Empty));

        addrmgr.bind(addr);
        slot.state = SlotState::Dialing { addr, since: now };

        self.outbox.connect(addr);
        self.outbox.event(Event::Connecting { addr, slot: index });
    }

    /// Called when a `version` message was received.
    fn received_version<T: ChainStore, P: Store>(
        &mut self,
        addr: &PeerId,
        msg: VersionMessage,
        addrmgr: &mut AddressManager<P, C>,
        chain: &T,
    ) {
        let minimal = self.config.minimal_peer_version;
        let (index, our_nonce) = match self.slot_index_by_addr(addr) {
            Some(index) => match &self.slots[index].state {
                SlotState::Connected { conn, .. } => (index, conn.our_nonce),
                _ => return,
            },
            None => return,
        };
        let VersionMessage {
            version,
            services,
            start_height,
            user_agent,
            nonce,
            ..
        } = msg;

        if nonce == our_nonce {
            self.disconnect_slot(index, DisconnectReason::SelfConnection);
            return;
        }
        debug!(
            target: "p2p",
            "{}: Peer version = {}, height = {}, agent = {}, services = {}",
            addr, version, start_height, user_agent, services
        );

        let mut complete = false;

        if let SlotState::Connected { conn, peer } = &mut self.slots[index].state {
            *peer = Some(PeerInfo {
                version,
                services,
                height: start_height.max(0) as Height,
                user_agent,
            });
            if version >= minimal {
                conn.handshake.we_accept_them = true;
            } else {
                debug!(
                    target: "p2p",
                    "{}: Peer version {} is below our minimum {}", addr, version, minimal
                );
            }
            complete = conn.handshake.is_complete();
        }
        if complete {
            self.negotiated(index, addrmgr, chain);
        }
    }

    /// Called when a `verack` message was received. We acknowledge theirs
    /// with our own.
    fn received_verack<T: ChainStore, P: Store>(
        &mut self,
        addr: &PeerId,
        addrmgr: &mut AddressManager<P, C>,
        chain: &T,
    ) {
        let index = match self.slot_index_by_addr(addr) {
            Some(index) => index,
            None => return,
        };
        let mut acknowledged = false;

        if let SlotState::Connected { conn, .. } = &mut self.slots[index].state {
            if conn.handshake.they_accepted_us {
                debug!(target: "p2p", "{}: Redundant `verack`", addr);
                return;
            }
            conn.handshake.they_accepted_us = true;
            acknowledged = true;
        }
        if acknowledged {
            self.outbox.verack(*addr);

            if self.slots[index].is_ready() {
                self.negotiated(index, addrmgr, chain);
            }
        }
    }

    /// The slot completed its handshake in both directions: run the
    /// post-handshake hook.
    fn negotiated<T: ChainStore, P: Store>(
        &mut self,
        index: usize,
        addrmgr: &mut AddressManager<P, C>,
        chain: &T,
    ) {
        let (addr, info) = match &self.slots[index].state {
            SlotState::Connected {
                conn,
                peer: Some(info),
            } => (conn.addr, info.clone()),
            _ => return,
        };

        // In initial block download a peer that is behind our own full
        // blocks can't serve us anything.
        if self.ibd && info.height < chain.max_full_block_height() {
            self.disconnect_slot(index, DisconnectReason::PeerHeight(info.height));
            return;
        }

        self.outbox.event(Event::Negotiated {
            addr,
            services: info.services,
            height: info.height,
            version: info.version,
            user_agent: info.user_agent,
        });

        if addrmgr.len() < self.config.getaddr_threshold {
            self.outbox.get_addr(addr);
        }
    }

    /// Create our `version` message for this peer.
    fn version(
        &self,
        addr: PeerId,
        local_addr: net::SocketAddr,
        nonce: u64,
        start_height: Height,
    ) -> VersionMessage {
        VersionMessage {
            version: self.config.protocol_version,
            services: self.config.services,
            timestamp: self.clock.local_time().block_time() as i64,
            receiver: Address::new(&addr, ServiceFlags::NONE),
            sender: Address::new(&local_addr, self.config.services),
            nonce,
            user_agent: self.config.user_agent.to_owned(),
            start_height: start_height as i32,
            relay: false,
        }
    }

    fn slot_by_addr_mut(&mut self, addr: &PeerId) -> Option<&mut Slot> {
        self.slots.iter_mut().find(|s| s.addr() == Some(*addr))
    }

    fn slot_index_by_addr(&self, addr: &PeerId) -> Option<usize> {
        self.slots.iter().position(|s| s.addr() == Some(*addr))
    }

    /// Whether an address is being dialed.
    pub fn is_dialing(&self, addr: &PeerId) -> bool {
        self.slots
            .iter()
            .any(|s| matches!(&s.state, SlotState::Dialing { addr: a, .. } if a == addr))
    }

    /// Whether an address occupies a slot with an established connection.
    pub fn is_connected(&self, addr: &PeerId) -> bool {
        self.slots
            .iter()
            .any(|s| matches!(&s.state, SlotState::Connected { conn, .. } if conn.addr == *addr))
    }

    /// The slot arena.
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Iterator over hand-shaken peers.
    pub fn negotiated_peers(&self) -> impl Iterator<Item = (&Connection, &PeerInfo)> {
        self.slots.iter().filter_map(|s| match &s.state {
            SlotState::Connected {
                conn,
                peer: Some(info),
            } if conn.handshake.is_complete() => Some((conn, info)),
            _ => None,
        })
    }

    /// Number of slots currently dialing.
    pub fn connecting(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s.state, SlotState::Dialing { .. }))
            .count()
    }
}
