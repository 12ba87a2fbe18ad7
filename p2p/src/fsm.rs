//! Bitcoin protocol state machine.
//!
//! Composes the sub-managers into one deterministic machine: the frame
//! codec hands decoded messages to the machine, the reactor's timer drives
//! the periodic task table, and all outputs are drained through the
//! [`Iterator`] impl.
#![warn(missing_docs)]
use crossbeam_channel as chan;
use log::*;

pub mod event;
pub mod output;
pub mod wire;

// Sub-protocols.
mod addrmgr;
mod peermgr;
mod pingmgr;
mod schedule;
mod syncmgr;


use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net;
use std::sync::Arc;

use finney_common::bitcoin::network::constants::ServiceFlags;
use finney_common::bitcoin::network::message::{NetworkMessage, RawNetworkMessage};
use finney_common::block::store::ChainStore;
use finney_common::block::time::{Clock, LocalDuration, LocalTime};
use finney_common::block::{BlockHash, Height};
use finney_common::network::Network;
use finney_common::p2p::peer::{Source, Store};
use finney_net as traits;

use addrmgr::AddressManager;
use peermgr::PeerManager;
use pingmgr::PingManager;
use schedule::{Schedule, TaskKind};
use syncmgr::SyncManager;

pub use event::Event;
pub use finney_net::Link;
use output::Outbox;

/// Peer-to-peer protocol version we advertise.
pub const PROTOCOL_VERSION: u32 = 70015;
/// Minimum peer protocol version we accept.
pub const MIN_PROTOCOL_VERSION: u32 = 70001;
/// User agent included in `version` messages.
pub const USER_AGENT: &str = "/finney:0.1.0/";

/// Block locators: starting hashes and a stop hash.
pub type Locators = (Vec<BlockHash>, BlockHash);

/// Output of a state transition.
pub type Io = finney_net::Io<RawNetworkMessage, Event, DisconnectReason>;

/// Identifies a peer.
pub type PeerId = net::SocketAddr;

/// Disconnect reason.
#[derive(Debug, Clone)]
pub enum DisconnectReason {
    /// Peer sent a message with the wrong network magic.
    PeerMagic(u32),
    /// Peer timed out on the given stage.
    PeerTimeout(&'static str),
    /// Peer chain is too far behind to serve the initial download.
    PeerHeight(Height),
    /// The connection outlived the configured peer lifetime.
    PeerLifetime,
    /// Connection to self was detected.
    SelfConnection,
    /// The slot range shrank and this connection is surplus.
    ConnectionLimit,
    /// Peer was disconnected by external command.
    Command,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerMagic(magic) => write!(f, "invalid message magic: {:#x}", magic),
            Self::PeerTimeout(stage) => write!(f, "peer timed out: {:?}", stage),
            Self::PeerHeight(height) => {
                write!(f, "peer height {} is too far behind", height)
            }
            Self::PeerLifetime => write!(f, "peer lifetime exceeded"),
            Self::SelfConnection => write!(f, "detected self-connection"),
            Self::ConnectionLimit => write!(f, "outbound slot limit reached"),
            Self::Command => write!(f, "received external command"),
        }
    }
}

impl From<DisconnectReason> for finney_net::Disconnect<DisconnectReason> {
    fn from(reason: DisconnectReason) -> Self {
        Self::StateMachine(reason)
    }
}

/// A snapshot of a connected peer, as returned by [`Command::GetPeers`].
#[derive(Debug, Clone)]
pub struct Peer {
    /// Peer address.
    pub addr: PeerId,
    /// Connected since this time.
    pub since: LocalTime,
    /// The peer's best height.
    pub height: Height,
    /// The peer's services.
    pub services: ServiceFlags,
    /// Peer user agent string.
    pub user_agent: String,
    /// Negotiated protocol version.
    pub version: u32,
    /// Measured latency, if any samples were recorded.
    pub latency: Option<LocalDuration>,
}

/// A command or request that can be sent to the state machine.
#[derive(Debug, Clone)]
pub enum Command {
    /// Get connected peers.
    GetPeers(chan::Sender<Vec<Peer>>),
    /// Get the tip of the active chain.
    GetTip(chan::Sender<(BlockHash, Height)>),
    /// Add a candidate address.
    Connect(net::SocketAddr),
    /// Disconnect from a peer.
    Disconnect(net::SocketAddr),
    /// Perform an orderly stop.
    Shutdown,
}

/// Configured limits.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Peer slot count outside initial block download.
    pub max_outgoing: usize,
    /// Peer slot count during initial block download.
    pub max_outgoing_ibd: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_outgoing: 8,
            max_outgoing_ibd: 16,
        }
    }
}

/// Liveness thresholds for the connectivity sweep.
#[derive(Debug, Clone)]
pub struct Tolerances {
    /// Time allowed for a peer to become hand-shaken.
    pub handshake: LocalDuration,
    /// Latency above which a fully-tested peer is flagged.
    pub latency: LocalDuration,
    /// Maximum connection age before a peer is recycled, if set.
    pub peer_life: Option<LocalDuration>,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            handshake: LocalDuration::from_secs(10),
            latency: LocalDuration::from_secs(1),
            peer_life: None,
        }
    }
}

/// Intervals of the periodic task table. A zero interval disables the task.
#[derive(Debug, Clone)]
pub struct Periods {
    /// Ping all hand-shaken peers.
    pub ping: LocalDuration,
    /// Sweep peers for liveness.
    pub connectivity: LocalDuration,
    /// Exchange headers and blocks.
    pub exchange: LocalDuration,
    /// Recompute initial-block-download mode.
    pub ibd: LocalDuration,
    /// Log a status snapshot.
    pub status: LocalDuration,
    /// Persist the chain store.
    pub save: LocalDuration,
    /// Stop the engine, once.
    pub autoexit: LocalDuration,
}

impl Default for Periods {
    fn default() -> Self {
        Self {
            ping: LocalDuration::from_secs(11),
            connectivity: LocalDuration::from_secs(10),
            exchange: LocalDuration::from_secs(1),
            ibd: LocalDuration::from_secs(60),
            status: LocalDuration::from_secs(2),
            save: LocalDuration::from_secs(120),
            autoexit: LocalDuration::ZERO,
        }
    }
}

/// State machine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bitcoin network we are connected to.
    pub network: Network,
    /// Addresses seeded into the candidate registry at startup.
    pub connect: Vec<net::SocketAddr>,
    /// Our protocol version.
    pub protocol_version: u32,
    /// Lowest remote protocol version we accept.
    pub minimal_peer_version: u32,
    /// Services offered by our node.
    pub services: ServiceFlags,
    /// Our user agent.
    pub user_agent: &'static str,
    /// Configured limits.
    pub limits: Limits,
    /// Candidate count below which a fresh handshake triggers `getaddr`.
    pub getaddr_threshold: usize,
    /// Full-block to tip-height ratio above which IBD mode exits.
    pub ibd_availability_threshold: f64,
    /// Liveness thresholds.
    pub tolerances: Tolerances,
    /// Task intervals.
    pub periods: Periods,
    /// Candidate age before the address book may evict it. Carried for the
    /// address-book component; the engine itself never evicts.
    pub addr_life: LocalDuration,
    /// Commands whose receive logging is suppressed.
    pub silent_commands: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: Network::default(),
            connect: Vec::new(),
            protocol_version: PROTOCOL_VERSION,
            minimal_peer_version: MIN_PROTOCOL_VERSION,
            services: ServiceFlags::NONE,
            user_agent: USER_AGENT,
            limits: Limits::default(),
            getaddr_threshold: 256,
            ibd_availability_threshold: 0.95,
            tolerances: Tolerances::default(),
            periods: Periods::default(),
            addr_life: LocalDuration::from_mins(30 * 24 * 60),
            silent_commands: Vec::new(),
        }
    }
}

impl Config {
    /// Construct a configuration for the given network and peers.
    pub fn from(network: Network, connect: Vec<net::SocketAddr>) -> Self {
        Self {
            network,
            connect,
            ..Self::default()
        }
    }
}

/// An instance of the Bitcoin P2P engine. Parametrized over the chain
/// store, the candidate store and the clock.
#[derive(Debug)]
pub struct StateMachine<T, P, C> {
    /// Chain store handle.
    chain: T,
    /// Bitcoin network we're connecting to.
    network: Network,
    /// Peer slot manager.
    peermgr: PeerManager<C>,
    /// Candidate address manager.
    addrmgr: AddressManager<P, C>,
    /// Ping manager.
    pingmgr: PingManager<C>,
    /// Block synchronization manager.
    syncmgr: SyncManager<C>,
    /// Periodic task table.
    schedule: Schedule,
    /// Addresses seeded at startup.
    connect: Vec<net::SocketAddr>,
    /// Commands whose receive logging is suppressed.
    silent: HashSet<String>,
    /// IBD exit threshold.
    ibd_availability_threshold: f64,
    /// Latency threshold for the sweep log.
    latency_tolerance: LocalDuration,
    /// Whether we are in initial block download.
    ibd: bool,
    /// Occurrences of unknown commands, by command name.
    unknown: HashMap<String, u64>,
    /// Set once an orderly stop has started.
    shutting_down: bool,
    /// Shared clock.
    clock: C,
    /// Outbound I/O queue.
    outbox: Outbox,
}

impl<T: ChainStore, P: Store, C: Clock> StateMachine<T, P, C> {
    /// Construct a new state machine instance.
    pub fn new(chain: T, candidates: P, clock: C, rng: fastrand::Rng, config: Config) -> Self {
        let Config {
            network,
            connect,
            protocol_version,
            minimal_peer_version,
            services,
            user_agent,
            limits,
            getaddr_threshold,
            ibd_availability_threshold,
            tolerances,
            periods,
            addr_life: _,
            silent_commands,
        } = config;

        let peermgr = PeerManager::new(
            peermgr::Config {
                protocol_version,
                minimal_peer_version,
                services,
                user_agent,
                max_outgoing: limits.max_outgoing,
                max_outgoing_ibd: limits.max_outgoing_ibd,
                getaddr_threshold,
                handshake_timeout: tolerances.handshake,
                peer_life: tolerances.peer_life,
            },
            rng.clone(),
            clock.clone(),
        );
        let addrmgr = AddressManager::new(
            addrmgr::Config {
                latency_tolerance: tolerances.latency,
            },
            rng.clone(),
            candidates,
            clock.clone(),
        );
        let pingmgr = PingManager::new(rng, clock.clone());
        let syncmgr = SyncManager::new(
            syncmgr::Config { protocol_version },
            clock.clone(),
        );
        let mut schedule = Schedule::new();
        schedule
            .task(TaskKind::PingPeers, periods.ping)
            .task(TaskKind::CheckConnectivity, periods.connectivity)
            .task(TaskKind::ExchangeData, periods.exchange)
            .task(TaskKind::ResetIbd, periods.ibd)
            .task(TaskKind::PrintStatus, periods.status)
            .task(TaskKind::SaveChain, periods.save)
            .one_shot(TaskKind::AutoExit, periods.autoexit);

        Self {
            chain,
            network,
            peermgr,
            addrmgr,
            pingmgr,
            syncmgr,
            schedule,
            connect,
            silent: silent_commands.into_iter().collect(),
            ibd_availability_threshold,
            latency_tolerance: tolerances.latency,
            ibd: false,
            unknown: HashMap::new(),
            shutting_down: false,
            clock,
            outbox: Outbox::default(),
        }
    }

    /// Create a draining iterator over the protocol outputs.
    pub fn drain(&mut self) -> Box<dyn Iterator<Item = Io> + '_> {
        Box::new(std::iter::from_fn(|| self.next()))
    }

    /// Whether the engine is in initial block download.
    pub fn is_ibd(&self) -> bool {
        self.ibd
    }

    /// Total number of unknown commands received and dropped.
    pub fn unknown_message_count(&self) -> u64 {
        self.unknown.values().sum()
    }

    /// Disconnect a peer.
    pub fn disconnect(&mut self, addr: PeerId, reason: DisconnectReason) {
        self.peermgr.disconnect(addr, reason);
    }

    /// Propagate an event internally to the sub-systems.
    pub fn event(&mut self, event: Event) {
        self.pingmgr.received_event(event.clone());
        self.syncmgr.received_event(event.clone(), &mut self.chain);
        self.addrmgr.received_event(event.clone());
        self.peermgr
            .received_event(event, &mut self.addrmgr, &self.chain);
    }

    /// Process a user command.
    pub fn command(&mut self, command: Command) {
        debug!(target: "p2p", "Received command: {:?}", command);

        match command {
            Command::GetPeers(reply) => {
                let peers = self
                    .peermgr
                    .negotiated_peers()
                    .map(|(conn, info)| Peer {
                        addr: conn.addr,
                        since: conn.since,
                        height: info.height,
                        services: info.services,
                        user_agent: info.user_agent.clone(),
                        version: info.version,
                        latency: self.pingmgr.latency(&conn.addr),
                    })
                    .collect();

                reply.send(peers).ok();
            }
            Command::GetTip(reply) => {
                reply.send(self.chain.tip()).ok();
            }
            Command::Connect(addr) => {
                let now = self.clock.local_time();

                self.addrmgr
                    .insert(addr, ServiceFlags::NONE, now, Source::Config);
            }
            Command::Disconnect(addr) => {
                self.peermgr.disconnect(addr, DisconnectReason::Command);
            }
            Command::Shutdown => {
                self.shutdown();
            }
        }
    }

    /// Perform an orderly stop: save the chain and tell the reactor to
    /// wind down.
    pub fn shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;

        info!(target: "p2p", "Shutting down..");

        if let Err(err) = self.chain.save() {
            warn!(target: "p2p", "Error saving chain state on shutdown: {}", err);
        }
        self.outbox.event(Event::ShuttingDown);
    }

    /// Recompute whether we are in initial block download: the share of
    /// contiguous full blocks relative to the best header.
    fn reset_ibd_mode(&mut self) {
        let (_, tip_height) = self.chain.tip();
        let max_full = self.chain.max_full_block_height();
        let ibd = if tip_height == 0 {
            false
        } else {
            max_full as f64 / tip_height as f64 <= self.ibd_availability_threshold
        };

        if ibd != self.ibd {
            info!(
                target: "p2p",
                "{} initial block download ({}/{} blocks)",
                if ibd { "Entering" } else { "Leaving" },
                max_full,
                tip_height
            );
        }
        self.ibd = ibd;
        self.peermgr.set_ibd(ibd, &mut self.addrmgr);
    }

    /// Log peers whose fully-tested latency exceeds the tolerance. Current
    /// policy is log-only.
    fn log_slow_peers(&self) {
        for (conn, _) in self.peermgr.negotiated_peers() {
            if !self.pingmgr.is_fully_tested(&conn.addr) {
                continue;
            }
            if let Some(latency) = self.pingmgr.latency(&conn.addr) {
                if latency > self.latency_tolerance {
                    warn!(
                        target: "p2p",
                        "{}: Average latency {} exceeds tolerance {}",
                        conn.addr,
                        latency,
                        self.latency_tolerance
                    );
                }
            }
        }
    }

    /// Log a status snapshot.
    fn print_status(&self) {
        let (tip, height) = self.chain.tip();
        let max_full = self.chain.max_full_block_height();
        let ready = self.peermgr.negotiated_peers().count();
        let connecting = self.peermgr.connecting();
        let target = self.peermgr.target_slots();

        let mut msg = Vec::new();

        msg.push(format!("tip = {}", tip));
        msg.push(format!("headers = {}", height));
        msg.push(format!("blocks = {}", max_full));
        msg.push(format!("peers = {}/{}", ready, target));
        msg.push(format!("connecting = {}", connecting));
        msg.push(format!("candidates = {}", self.addrmgr.len()));
        msg.push(format!("in-flight = {}", self.syncmgr.in_flight()));
        if self.ibd {
            msg.push("ibd".to_owned());
        }
        info!(target: "node", "{}", msg.join(", "));

        for (conn, info) in self.peermgr.negotiated_peers() {
            let latency = self
                .pingmgr
                .latency(&conn.addr)
                .map(|l| l.to_string())
                .unwrap_or_else(|| "?".to_owned());

            info!(
                target: "node",
                "peer {}: height = {}, latency = {}, agent = {}",
                conn.addr,
                info.height,
                latency,
                info.user_agent
            );
        }
    }
}

impl<T: ChainStore, P: Store, C: Clock> Iterator for StateMachine<T, P, C> {
    type Item = Io;

    fn next(&mut self) -> Option<Io> {
        let next = self
            .outbox
            .next()
            .or_else(|| self.peermgr.next())
            .or_else(|| self.syncmgr.next())
            .or_else(|| self.pingmgr.next())
            .or_else(|| self.addrmgr.next())
            .map(|io| match io {
                output::Io::Write(addr, payload) => Io::Write(
                    addr,
                    RawNetworkMessage {
                        magic: self.network.magic(),
                        payload,
                    },
                ),
                output::Io::Connect(addr) => Io::Connect(addr),
                output::Io::Disconnect(addr, reason) => Io::Disconnect(addr, reason),
                output::Io::SetTimer(duration) => Io::SetTimer(duration),
                output::Io::Event(event) => Io::Event(event),
            });

        match next {
            Some(Io::Event(event)) => {
                self.event(event.clone());

                Some(Io::Event(event))
            }
            other => other,
        }
    }
}

impl<T: ChainStore, P: Store, C: Clock> traits::StateMachine for StateMachine<T, P, C> {
    type Message = RawNetworkMessage;
    type Event = Event;
    type DisconnectReason = DisconnectReason;

    fn initialize(&mut self, time: LocalTime) {
        self.clock.set(time);
        self.outbox.event(Event::Initializing);
        self.addrmgr.initialize();

        for addr in self.connect.clone() {
            self.addrmgr
                .insert(addr, ServiceFlags::NONE, time, Source::Config);
        }
        self.reset_ibd_mode();
        self.peermgr.initialize(&mut self.addrmgr);
        self.schedule.initialize(time);

        if let Some(wait) = self.schedule.wait(time) {
            self.outbox.set_timer(wait);
        }
        self.outbox.event(Event::Ready {
            tip: self.chain.tip().1,
            time,
        });
    }

    fn message_received(&mut self, addr: &net::SocketAddr, message: Cow<RawNetworkMessage>) {
        let command = message.cmd();
        let addr = *addr;
        let message = message.into_owned();

        if message.magic != self.network.magic() {
            return self
                .peermgr
                .disconnect(addr, DisconnectReason::PeerMagic(message.magic));
        }
        if !self.peermgr.is_connected(&addr) {
            debug!(target: "p2p", "Received `{}` from unknown peer {}", command, addr);
            return;
        }
        if !self.silent.contains(command) {
            debug!(target: "p2p", "{}: Received `{}`", addr, command);
        }

        match message.payload {
            NetworkMessage::Unknown { command, .. } => {
                // Counted and dropped.
                *self.unknown.entry(command.to_string()).or_default() += 1;
            }
            NetworkMessage::Reject(ref reject) => {
                debug!(
                    target: "p2p",
                    "{}: Peer rejected `{}`: {:?}", addr, reject.message, reject.reason
                );
            }
            payload => {
                self.event(Event::MessageReceived {
                    from: addr,
                    message: Arc::new(payload),
                });
            }
        }
    }

    fn message_sent(&mut self, addr: &net::SocketAddr, message: &RawNetworkMessage) {
        self.event(Event::MessageSent {
            to: *addr,
            command: message.cmd(),
        });
    }

    fn attempted(&mut self, addr: &net::SocketAddr) {
        self.peermgr.peer_attempted(addr);
    }

    fn connected(&mut self, addr: net::SocketAddr, local_addr: &net::SocketAddr, link: Link) {
        let height = self.chain.tip().1;

        self.peermgr
            .peer_connected(addr, *local_addr, link, height);
    }

    fn disconnected(
        &mut self,
        addr: &net::SocketAddr,
        reason: finney_net::Disconnect<DisconnectReason>,
    ) {
        self.peermgr
            .peer_disconnected(addr, &mut self.addrmgr, reason);
    }

    fn tick(&mut self, local_time: LocalTime) {
        self.clock.set(local_time);
    }

    fn timer_expired(&mut self) {
        let now = self.clock.local_time();

        for kind in self.schedule.due(now) {
            match kind {
                TaskKind::PingPeers => {
                    self.pingmgr.ping_peers();
                }
                TaskKind::CheckConnectivity => {
                    self.peermgr.check_connectivity(&mut self.addrmgr);
                    self.log_slow_peers();
                }
                TaskKind::ExchangeData => {
                    let peers = self
                        .peermgr
                        .negotiated_peers()
                        .map(|(conn, info)| (conn.addr, info.height))
                        .collect::<Vec<_>>();

                    self.syncmgr.exchange_data(&self.chain, peers.into_iter());
                }
                TaskKind::ResetIbd => {
                    self.reset_ibd_mode();
                }
                TaskKind::PrintStatus => {
                    self.print_status();
                }
                TaskKind::SaveChain => {
                    if let Err(err) = self.chain.save() {
                        warn!(target: "p2p", "Error saving chain state: {}", err);
                    }
                }
                TaskKind::AutoExit => {
                    info!(target: "p2p", "Automatic exit timer expired");
                    self.shutdown();
                }
            }
        }
        if let Some(wait) = self.schedule.wait(now) {
            self.outbox.set_timer(wait);
        }
    }
}
