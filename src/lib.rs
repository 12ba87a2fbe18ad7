//! Finney is the peer-to-peer networking engine of a Bitcoin full node:
//! it dials and maintains a fleet of outbound peers, frames and dispatches
//! wire messages, drives the handshake and liveness state machines, and
//! schedules header and block synchronization against a chain store.
//!
//! The engine is split into a deterministic protocol state machine
//! ([`p2p`]) and a poll reactor that owns all sockets and timers
//! ([`node`]). See the member crates for details.

#[cfg(feature = "finney-common")]
pub use finney_common as common;

#[cfg(feature = "finney-net")]
pub use finney_net as net;

#[cfg(feature = "finney-node")]
pub use finney_node as node;

#[cfg(feature = "finney-p2p")]
pub use finney_p2p as p2p;
