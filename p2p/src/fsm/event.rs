//! State machine events.
use std::fmt;
use std::net;
use std::sync::Arc;

use finney_common::bitcoin::network::constants::ServiceFlags;
use finney_common::bitcoin::network::message::NetworkMessage;
use finney_common::block::Height;
use finney_net::time::{LocalDuration, LocalTime};
use finney_net::{Disconnect, Link};

use super::DisconnectReason;

/// Event emitted by the state machine and fanned back out to its
/// sub-managers, as well as notified to outside subscribers.
#[derive(Debug, Clone)]
pub enum Event {
    /// The state machine is initializing.
    Initializing,
    /// The state machine is ready to serve.
    Ready {
        /// Height of the active chain.
        tip: Height,
        /// Local time at readiness.
        time: LocalTime,
    },
    /// A message was received from a peer.
    MessageReceived {
        /// Sending peer.
        from: net::SocketAddr,
        /// The decoded message payload.
        message: Arc<NetworkMessage>,
    },
    /// A queued message finished writing to a peer's socket.
    MessageSent {
        /// Receiving peer.
        to: net::SocketAddr,
        /// Wire command of the written message.
        command: &'static str,
    },
    /// An outbound connection is being attempted into a peer slot.
    Connecting {
        /// Candidate being dialed.
        addr: net::SocketAddr,
        /// Index of the slot the candidate is bound to.
        slot: usize,
    },
    /// A connection was established.
    Connected {
        /// Peer address.
        addr: net::SocketAddr,
        /// Our address, as seen from the socket.
        local_addr: net::SocketAddr,
        /// Connection direction.
        link: Link,
    },
    /// A peer completed the handshake in both directions.
    Negotiated {
        /// Peer address.
        addr: net::SocketAddr,
        /// Services advertised by the peer.
        services: ServiceFlags,
        /// Chain height advertised in the peer's `version`.
        height: Height,
        /// Protocol version advertised by the peer.
        version: u32,
        /// The peer's user agent.
        user_agent: String,
    },
    /// A peer connection was closed.
    Disconnected {
        /// Peer address.
        addr: net::SocketAddr,
        /// Why the connection ended.
        reason: Disconnect<DisconnectReason>,
    },
    /// A peer's latency ring filled up; its moving average is known.
    PeerLatency {
        /// Peer address.
        addr: net::SocketAddr,
        /// Mean of the recorded latency samples.
        average: LocalDuration,
    },
    /// The engine is performing an orderly stop.
    ShuttingDown,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "Initializing"),
            Self::Ready { tip, .. } => write!(f, "Ready to serve, tip height = {}", tip),
            Self::MessageReceived { from, message } => {
                write!(f, "{}: Received `{}`", from, message.cmd())
            }
            Self::MessageSent { to, command } => write!(f, "{}: Sent `{}`", to, command),
            Self::Connecting { addr, slot } => {
                write!(f, "Connecting to {} in slot #{}", addr, slot)
            }
            Self::Connected { addr, link, .. } => {
                write!(f, "{}: Peer connected ({:?})", addr, link)
            }
            Self::Negotiated {
                addr,
                services,
                height,
                ..
            } => write!(
                f,
                "{}: Peer negotiated with services {} at height {}",
                addr, services, height
            ),
            Self::Disconnected { addr, reason } => {
                write!(f, "Disconnected from {} ({})", addr, reason)
            }
            Self::PeerLatency { addr, average } => {
                write!(f, "{}: Peer latency averages {}", addr, average)
            }
            Self::ShuttingDown => write!(f, "Shutting down"),
        }
    }
}
