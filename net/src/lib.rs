//! Networking primitives shared between the protocol state machine and the
//! reactors that drive it.
//!
//! The state machine is a pure function of its inputs: bytes, connection
//! events and timer expiries go in, [`Io`] instructions come out. Everything
//! that actually touches a socket lives on the reactor side of this
//! boundary.
#![warn(missing_docs)]
use std::borrow::Cow;
use std::fmt;
use std::io;
use std::net;
use std::sync::Arc;

pub mod time;

use time::{LocalDuration, LocalTime};

/// Direction of a peer connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Link {
    /// The remote connected to us.
    Inbound,
    /// We connected to the remote.
    Outbound,
}

impl Link {
    /// Whether this is an outbound link.
    pub fn is_outbound(&self) -> bool {
        *self == Link::Outbound
    }

    /// Whether this is an inbound link.
    pub fn is_inbound(&self) -> bool {
        *self == Link::Inbound
    }
}

/// Why a connection ended.
#[derive(Debug, Clone)]
pub enum Disconnect<R> {
    /// The state machine decided to disconnect.
    StateMachine(R),
    /// The connection failed or was severed at the transport level.
    ConnectionError(Arc<io::Error>),
    /// The connection could not be established in the first place.
    DialError(Arc<io::Error>),
}

impl<R> Disconnect<R> {
    /// Whether the connection never got established.
    pub fn is_dial_err(&self) -> bool {
        matches!(self, Self::DialError(_))
    }
}

impl<R: fmt::Display> fmt::Display for Disconnect<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StateMachine(reason) => write!(f, "{}", reason),
            Self::ConnectionError(err) => write!(f, "connection error: {}", err),
            Self::DialError(err) => write!(f, "dial error: {}", err),
        }
    }
}

/// Instruction emitted by a state machine, carried out by a reactor.
#[derive(Debug, Clone)]
pub enum Io<M, E, D> {
    /// Send a message to a peer.
    Write(net::SocketAddr, M),
    /// Establish an outbound connection.
    Connect(net::SocketAddr),
    /// Close a connection.
    Disconnect(net::SocketAddr, D),
    /// Call back [`StateMachine::timer_expired`] after the given duration.
    SetTimer(LocalDuration),
    /// Notify subscribers of an event.
    Event(E),
}

/// A deterministic protocol state machine, driven by a reactor.
///
/// The reactor owns the sockets and timers; the machine owns all protocol
/// state. Outputs are drained through the [`Iterator`] supertrait after
/// every input.
pub trait StateMachine:
    Iterator<Item = Io<Self::Message, Self::Event, Self::DisconnectReason>>
{
    /// Message type exchanged with peers.
    type Message: Clone;
    /// Event type notified to subscribers.
    type Event;
    /// Reason given when the machine disconnects a peer.
    type DisconnectReason;

    /// Initialize the machine. Called once, before any other input.
    fn initialize(&mut self, _time: LocalTime) {}

    /// A complete, checksum-valid message arrived from a peer.
    fn message_received(&mut self, addr: &net::SocketAddr, message: Cow<Self::Message>);

    /// A previously queued message finished writing to the peer's socket.
    ///
    /// This is the post-send hook: timestamps that must reflect wire time
    /// rather than enqueue time are recorded here.
    fn message_sent(&mut self, _addr: &net::SocketAddr, _message: &Self::Message) {}

    /// An outbound connection attempt was started.
    fn attempted(&mut self, addr: &net::SocketAddr);

    /// A connection was established.
    fn connected(&mut self, addr: net::SocketAddr, local_addr: &net::SocketAddr, link: Link);

    /// A connection was closed. This is the close-completion callback: the
    /// socket is gone by the time it fires.
    fn disconnected(&mut self, addr: &net::SocketAddr, reason: Disconnect<Self::DisconnectReason>);

    /// Update the machine's clock.
    fn tick(&mut self, local_time: LocalTime);

    /// A timer set via [`Io::SetTimer`] expired.
    fn timer_expired(&mut self);
}
