//! Bitcoin peer-to-peer engine daemon.
//!
//! Wires the protocol state machine to the poll reactor, the in-memory
//! chain model and the admin surface, and exposes a command handle for
//! callers driving a running node.
#![warn(missing_docs)]
use std::collections::HashMap;
use std::io;
use std::net;

use crossbeam_channel as chan;
use log::*;
use thiserror::Error;

use finney_common::block::store::model::ChainModel;
use finney_common::block::time::{LocalTime, RefClock};
use finney_common::block::{BlockHash, Height};
use finney_common::p2p::peer::KnownCandidate;
use finney_p2p::fsm;
pub use finney_p2p::fsm::{Command, Peer};

pub mod logger;
pub mod reactor;

use reactor::Reactor;

/// An error coming from the daemon.
#[derive(Debug, Error)]
pub enum Error {
    /// An I/O error, eg. failing to bind the admin port.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The node is no longer running.
    #[error("the node is not running")]
    NotRunning,
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Protocol configuration.
    pub protocol: fsm::Config,
    /// Admin TCP port accepting the `KILL` command.
    pub operation_port: u16,
    /// Admin listener backlog. Recorded for operators; the standard
    /// listener doesn't expose the knob, so the system default applies.
    pub backlog: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            protocol: fsm::Config::default(),
            operation_port: 9494,
            backlog: 8,
        }
    }
}

/// Handle for sending commands into a running node.
#[derive(Debug, Clone)]
pub struct Handle {
    commands: chan::Sender<Command>,
}

impl Handle {
    /// Ask the node to stop.
    pub fn shutdown(&self) -> Result<(), Error> {
        self.command(Command::Shutdown)
    }

    /// Add a candidate address.
    pub fn connect(&self, addr: net::SocketAddr) -> Result<(), Error> {
        self.command(Command::Connect(addr))
    }

    /// Get the connected peers.
    pub fn get_peers(&self) -> Result<Vec<Peer>, Error> {
        let (reply, answers) = chan::bounded(1);

        self.command(Command::GetPeers(reply))?;
        answers.recv().map_err(|_| Error::NotRunning)
    }

    /// Get the tip of the active chain.
    pub fn get_tip(&self) -> Result<(BlockHash, Height), Error> {
        let (reply, answers) = chan::bounded(1);

        self.command(Command::GetTip(reply))?;
        answers.recv().map_err(|_| Error::NotRunning)
    }

    fn command(&self, command: Command) -> Result<(), Error> {
        self.commands.send(command).map_err(|_| Error::NotRunning)
    }
}

/// Create a command channel for a node. The receiving end is passed to
/// [`run`], the handle stays with the caller.
pub fn channel() -> (Handle, chan::Receiver<Command>) {
    let (commands, receiver) = chan::unbounded();

    (Handle { commands }, receiver)
}

/// Run the daemon on the calling thread until it shuts down.
pub fn run(config: Config, commands: chan::Receiver<Command>) -> Result<(), Error> {
    let network = config.protocol.network;

    info!(target: "node", "Initializing daemon..");
    info!(target: "node", "Genesis block hash is {}", network.genesis_hash());

    let clock = RefClock::from(LocalTime::now());
    let chain = ChainModel::new(network.genesis());
    let candidates: HashMap<net::SocketAddr, KnownCandidate> = HashMap::new();
    let rng = fastrand::Rng::new();
    let machine = fsm::StateMachine::new(chain, candidates, clock.clone(), rng, config.protocol);
    let admin_addr: net::SocketAddr = ([0, 0, 0, 0], config.operation_port).into();

    let mut reactor = Reactor::new(machine, clock, network.magic(), commands, admin_addr)?;

    info!(
        target: "node",
        "Listening for admin commands on port {} ({} network)",
        config.operation_port,
        network.as_str()
    );
    reactor.run()?;

    Ok(())
}
