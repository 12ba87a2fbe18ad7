//! Candidate address store interface.
//!
//! The engine never persists addresses itself; it reads the store once at
//! startup and writes newly learned candidates back into it. Flushing the
//! store to disk, and evicting entries past their configured lifetime, is
//! the address-book component's job.
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net;

use bitcoin::network::constants::ServiceFlags;

use crate::block::time::LocalTime;

/// Where a candidate address was learned from.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Source {
    /// Configured at startup.
    Config,
    /// Advertised by a peer in an `addr` message.
    Peer(net::SocketAddr),
    /// Loaded from the persisted address book.
    Store,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config => write!(f, "config"),
            Self::Peer(addr) => write!(f, "peer ({})", addr),
            Self::Store => write!(f, "store"),
        }
    }
}

/// A candidate address as persisted by the address-book component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownCandidate {
    /// Advertised service bits.
    pub services: ServiceFlags,
    /// Last time the address was seen.
    pub last_seen: LocalTime,
    /// Where the address came from.
    pub source: Source,
}

/// Candidate address store.
pub trait Store {
    /// Get a known candidate.
    fn get(&self, addr: &net::SocketAddr) -> Option<&KnownCandidate>;

    /// Insert a candidate. Returns `true` if the address wasn't known.
    fn insert(&mut self, addr: net::SocketAddr, candidate: KnownCandidate) -> bool;

    /// Iterate over all known candidates.
    fn iter<'a>(&'a self) -> Box<dyn Iterator<Item = (&'a net::SocketAddr, &'a KnownCandidate)> + 'a>;

    /// Number of stored candidates.
    fn len(&self) -> usize;

    /// Whether the store is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist the store.
    fn flush(&mut self) -> io::Result<()>;
}

/// In-memory candidate store.
impl Store for HashMap<net::SocketAddr, KnownCandidate> {
    fn get(&self, addr: &net::SocketAddr) -> Option<&KnownCandidate> {
        HashMap::get(self, addr)
    }

    fn insert(&mut self, addr: net::SocketAddr, candidate: KnownCandidate) -> bool {
        HashMap::insert(self, addr, candidate).is_none()
    }

    fn iter<'a>(&'a self) -> Box<dyn Iterator<Item = (&'a net::SocketAddr, &'a KnownCandidate)> + 'a> {
        Box::new(HashMap::iter(self))
    }

    fn len(&self) -> usize {
        HashMap::len(self)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
