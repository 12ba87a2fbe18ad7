//! Peer-to-peer engine of the finney node.
//!
//! This crate implements the protocol state machine: message framing and
//! dispatch, the per-peer handshake and liveness machinery, candidate
//! selection, block synchronization and the periodic task schedule. It
//! performs no I/O; a reactor drives it through the
//! [`finney_net::StateMachine`] trait.
#![allow(clippy::too_many_arguments)]
pub mod fsm;

pub use fsm::{Command, Config, DisconnectReason, Event, Limits, PeerId, StateMachine};
