//! Test peer harness: drives the state machine directly, with a shared
//! clock and an in-memory chain model standing in for the reactor and the
//! chain store.
use std::borrow::Cow;
use std::collections::HashMap;
use std::net;
use std::ops::{Deref, DerefMut};

use finney_common::bitcoin::network::address::Address;
use finney_common::bitcoin::network::constants::ServiceFlags;
use finney_common::bitcoin::network::message::{NetworkMessage, RawNetworkMessage};
use finney_common::bitcoin::network::message_network::VersionMessage;
use finney_common::block::store::model::ChainModel;
use finney_common::block::time::{Clock, LocalDuration, LocalTime, RefClock};
use finney_common::block::Height;
use finney_common::network::Network;
use finney_common::p2p::peer::KnownCandidate;
use finney_net::{Link, StateMachine as _};

use crate::fsm::{Config, Event, Io, Limits, PeerId, StateMachine};

/// The state machine under test.
pub type Machine = StateMachine<ChainModel, HashMap<net::SocketAddr, KnownCandidate>, RefClock>;

/// Start of time for all tests.
pub const GENESIS_TIME: u64 = 1_700_000_000;

/// A node under test.
pub struct Peer {
    /// The protocol instance.
    pub machine: Machine,
    /// Clock shared with the machine.
    pub clock: RefClock,
    /// Our own address.
    pub addr: PeerId,
    /// The network under test.
    pub network: Network,
}

impl Deref for Peer {
    type Target = Machine;

    fn deref(&self) -> &Machine {
        &self.machine
    }
}

impl DerefMut for Peer {
    fn deref_mut(&mut self) -> &mut Machine {
        &mut self.machine
    }
}

impl Peer {
    /// Create and initialize a peer seeded with the given candidates.
    pub fn new(candidates: Vec<PeerId>, config: Config) -> Self {
        let network = config.network;
        let clock = RefClock::from(LocalTime::from_secs(GENESIS_TIME));
        let chain = ChainModel::new(network.genesis());
        let rng = fastrand::Rng::with_seed(48);
        let config = Config {
            connect: candidates,
            ..config
        };
        let mut machine = StateMachine::new(chain, HashMap::new(), clock.clone(), rng, config);

        machine.initialize(clock.local_time());

        Self {
            machine,
            clock,
            addr: ([127, 0, 0, 1], network.port()).into(),
            network,
        }
    }

    /// A single-slot test configuration.
    pub fn config() -> Config {
        Config {
            limits: Limits {
                max_outgoing: 1,
                max_outgoing_ibd: 2,
            },
            ..Config::default()
        }
    }

    /// Drain all pending outputs.
    pub fn outputs(&mut self) -> Vec<Io> {
        self.machine.drain().collect()
    }

    /// Feed a message from a remote peer.
    pub fn received(&mut self, from: &PeerId, payload: NetworkMessage) {
        let raw = RawNetworkMessage {
            magic: self.network.magic(),
            payload,
        };
        self.machine.message_received(from, Cow::Owned(raw));
    }

    /// Report a queued message as written to the wire.
    pub fn sent(&mut self, to: &PeerId, payload: &NetworkMessage) {
        let raw = RawNetworkMessage {
            magic: self.network.magic(),
            payload: payload.clone(),
        };
        self.machine.message_sent(to, &raw);
    }

    /// Advance the clock without firing timers.
    pub fn advance(&mut self, duration: LocalDuration) {
        let time = self.clock.local_time() + duration;

        self.machine.tick(time);
    }

    /// Advance the clock and fire due timers.
    pub fn elapse(&mut self, duration: LocalDuration) {
        self.advance(duration);
        self.machine.timer_expired();
    }

    /// The `version` message a remote would send us.
    pub fn remote_version(&self, remote: &PeerId, nonce: u64, height: Height) -> VersionMessage {
        VersionMessage {
            version: crate::fsm::PROTOCOL_VERSION,
            services: ServiceFlags::NETWORK,
            timestamp: self.clock.local_time().block_time() as i64,
            receiver: Address::new(&self.addr, ServiceFlags::NONE),
            sender: Address::new(remote, ServiceFlags::NETWORK),
            nonce,
            user_agent: "/remote:1.0/".to_owned(),
            start_height: height as i32,
            relay: false,
        }
    }

    /// Complete the TCP connect to a remote the machine is dialing.
    pub fn establish(&mut self, remote: &PeerId) -> Vec<Io> {
        let local = self.addr;

        self.machine.attempted(remote);
        self.machine.connected(*remote, &local, Link::Outbound);
        self.outputs()
    }

    /// Walk a full outbound handshake with `remote`, which must already be
    /// dialing. Returns the outputs accumulated along the way.
    pub fn handshake(&mut self, remote: &PeerId, height: Height) -> Vec<Io> {
        let mut outputs = self.establish(remote);

        assert!(
            messages_to(&outputs, remote)
                .iter()
                .any(|m| matches!(m, NetworkMessage::Version(_))),
            "our `version` should be sent on connect"
        );

        self.received(
            remote,
            NetworkMessage::Version(self.remote_version(remote, 999, height)),
        );
        outputs.extend(self.outputs());

        self.received(remote, NetworkMessage::Verack);
        outputs.extend(self.outputs());

        assert!(
            outputs.iter().any(
                |o| matches!(o, Io::Event(Event::Negotiated { addr, .. }) if addr == remote)
            ),
            "peer handshake should succeed"
        );
        outputs
    }
}

/// Messages written to the given address.
pub fn messages_to(outputs: &[Io], addr: &PeerId) -> Vec<NetworkMessage> {
    outputs
        .iter()
        .filter_map(|o| match o {
            Io::Write(a, raw) if a == addr => Some(raw.payload.clone()),
            _ => None,
        })
        .collect()
}

/// Addresses the machine asked to connect to.
pub fn connects(outputs: &[Io]) -> Vec<PeerId> {
    outputs
        .iter()
        .filter_map(|o| match o {
            Io::Connect(addr) => Some(*addr),
            _ => None,
        })
        .collect()
}

/// Disconnects requested by the machine.
pub fn disconnects(outputs: &[Io]) -> Vec<PeerId> {
    outputs
        .iter()
        .filter_map(|o| match o {
            Io::Disconnect(addr, _) => Some(*addr),
            _ => None,
        })
        .collect()
}
