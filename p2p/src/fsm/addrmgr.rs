//! Candidate address registry and scoring.
//!
//! Keeps every address the engine has ever learned about, scores them, and
//! hands the best unbound candidate to the peer manager when a slot needs a
//! fresh peer. Candidates are never removed, only disabled; eviction by age
//! is the address-book component's policy, not ours.
use std::collections::{HashMap, HashSet};
use std::net;

use log::*;

use finney_common::bitcoin::network::address::Address;
use finney_common::bitcoin::network::constants::ServiceFlags;
use finney_common::bitcoin::network::message::NetworkMessage;
use finney_common::block::time::{Clock, LocalDuration, LocalTime};
use finney_common::block::BlockTime;
use finney_common::p2p::peer::{KnownCandidate, Source, Store};

use super::event::Event;
use super::output::{Io, Outbox};
use super::PeerId;

/// Penalty subtracted from timestamps learned through `addr` messages.
pub const ADDR_TIMESTAMP_PENALTY: LocalDuration = LocalDuration::from_mins(2 * 60);
/// Maximum number of addresses sent in reply to `getaddr`.
pub const MAX_ADDR_SAMPLE: usize = 32;

/// Score assigned to a disabled candidate.
const DISABLED_SCORE: f64 = -10.;

/// Candidate status.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    /// Eligible for selection.
    Active,
    /// Kept on record, but heavily penalized by the scorer.
    Disabled,
}

/// A known network address that may become a peer.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// The candidate's IPv4 address and port.
    pub addr: PeerId,
    /// Advertised service bits.
    pub services: ServiceFlags,
    /// Last time this address was seen or used.
    pub last_seen: LocalTime,
    /// Whether the candidate is eligible for selection.
    pub status: Status,
    /// Moving-average latency, zero when unknown.
    pub avg_latency: LocalDuration,
    /// Where the address was learned from.
    pub source: Source,
}

impl Candidate {
    /// Score this candidate. The shuffle term is passed in so that
    /// selection can inject randomness while property checks keep it fixed.
    pub fn score(&self, now: LocalTime, latency_tolerance: LocalDuration, shuffle: f64) -> f64 {
        let status = match self.status {
            Status::Active => 0.,
            Status::Disabled => DISABLED_SCORE,
        };
        let age = now - self.last_seen;
        // Week-old addresses are stale-ish, day-old ones are ideal, and
        // fresher ones were likely just used as a peer.
        let timestamp = if age > LocalDuration::from_mins(7 * 24 * 60) {
            0.8
        } else if age > LocalDuration::from_mins(24 * 60) {
            1.0
        } else {
            0.5
        };
        let latency = if self.avg_latency.is_zero() {
            1.
        } else {
            latency_tolerance.as_millis() as f64 / self.avg_latency.as_millis() as f64
        };
        status + timestamp + latency + shuffle
    }
}

/// Address manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Latency above which a peer is considered slow; also the nominator of
    /// the latency score.
    pub latency_tolerance: LocalDuration,
}

/// Manages the candidate address registry.
#[derive(Debug)]
pub struct AddressManager<P, C> {
    /// All known candidates, by address.
    candidates: HashMap<PeerId, Candidate>,
    /// Addresses currently bound to a peer slot.
    bound: HashSet<PeerId>,
    /// Persistent address store, owned by the address-book component.
    store: P,
    config: Config,
    rng: fastrand::Rng,
    outbox: Outbox,
    clock: C,
}

impl<P, C> Iterator for AddressManager<P, C> {
    type Item = Io;

    fn next(&mut self) -> Option<Io> {
        self.outbox.next()
    }
}

impl<P: Store, C: Clock> AddressManager<P, C> {
    /// Create a new address manager.
    pub fn new(config: Config, rng: fastrand::Rng, store: P, clock: C) -> Self {
        Self {
            candidates: HashMap::new(),
            bound: HashSet::new(),
            store,
            config,
            rng,
            outbox: Outbox::default(),
            clock,
        }
    }

    /// Load the persisted store into the registry. Must be called once.
    pub fn initialize(&mut self) {
        let known = self
            .store
            .iter()
            .map(|(addr, c)| (*addr, c.clone()))
            .collect::<Vec<_>>();

        for (addr, candidate) in known {
            self.insert(addr, candidate.services, candidate.last_seen, candidate.source);
        }
        if !self.candidates.is_empty() {
            info!(target: "p2p", "Loaded {} candidate address(es)", self.candidates.len());
        }
    }

    /// Event received.
    pub fn received_event(&mut self, event: Event) {
        match event {
            Event::MessageReceived { from, message } => match message.as_ref() {
                NetworkMessage::Addr(addrs) => self.received_addr(from, addrs),
                NetworkMessage::GetAddr => self.received_getaddr(from),
                _ => {}
            },
            Event::PeerLatency { addr, average } => self.record_latency(addr, average),
            Event::Negotiated { addr, .. } => {
                // The candidate was just used; mark it fresh so the scorer
                // de-prioritizes it for a while.
                if let Some(candidate) = self.candidates.get_mut(&addr) {
                    candidate.last_seen = self.clock.local_time();
                }
            }
            _ => {}
        }
    }

    /// Called when an `addr` message was received. Non-IPv4 records are
    /// skipped, and advertised timestamps get the standard two-hour penalty.
    pub fn received_addr(&mut self, from: PeerId, addrs: &[(BlockTime, Address)]) {
        let mut inserted = 0;

        for (time, addr) in addrs {
            let socket = match addr.socket_addr() {
                Ok(socket @ net::SocketAddr::V4(_)) => socket,
                _ => continue,
            };
            let last_seen = LocalTime::from_secs(*time as u64) - ADDR_TIMESTAMP_PENALTY;

            if self.insert(socket, addr.services, last_seen, Source::Peer(from)) {
                inserted += 1;
            }
        }
        if inserted > 0 {
            debug!(
                target: "p2p",
                "Inserted {} new candidate(s) out of {} from {}",
                inserted,
                addrs.len(),
                from
            );
        }
    }

    /// Called when a `getaddr` message was received. Replies with a bounded
    /// sample of active candidates.
    fn received_getaddr(&mut self, from: PeerId) {
        let sample = self
            .candidates
            .values()
            .filter(|c| c.status == Status::Active && c.addr != from)
            .take(MAX_ADDR_SAMPLE)
            .map(|c| (c.last_seen.block_time(), Address::new(&c.addr, c.services)))
            .collect::<Vec<_>>();

        if !sample.is_empty() {
            self.outbox.addr(from, sample);
        }
    }

    /// Insert a candidate. Re-inserting a known address keeps the freshest
    /// timestamp and the union of advertised services; inserting the same
    /// record twice is therefore a no-op. Returns `true` for new entries.
    pub fn insert(
        &mut self,
        addr: PeerId,
        services: ServiceFlags,
        last_seen: LocalTime,
        source: Source,
    ) -> bool {
        if !addr.is_ipv4() {
            return false;
        }
        match self.candidates.get_mut(&addr) {
            Some(candidate) => {
                candidate.last_seen = candidate.last_seen.max(last_seen);
                candidate.services |= services;

                false
            }
            None => {
                self.candidates.insert(
                    addr,
                    Candidate {
                        addr,
                        services,
                        last_seen,
                        status: Status::Active,
                        avg_latency: LocalDuration::ZERO,
                        source,
                    },
                );
                self.store.insert(
                    addr,
                    KnownCandidate {
                        services,
                        last_seen,
                        source,
                    },
                );
                true
            }
        }
    }

    /// Record a peer's fully-tested latency average on its candidate.
    fn record_latency(&mut self, addr: PeerId, average: LocalDuration) {
        if let Some(candidate) = self.candidates.get_mut(&addr) {
            candidate.avg_latency = average;
        }
    }

    /// Disable a candidate. It stays on record and can still be selected in
    /// degraded conditions, with a heavy score penalty.
    pub fn disable(&mut self, addr: &PeerId) {
        if let Some(candidate) = self.candidates.get_mut(addr) {
            if candidate.status != Status::Disabled {
                debug!(target: "p2p", "Disabling candidate {}", addr);
                candidate.status = Status::Disabled;
            }
        }
    }

    /// Mark a candidate as bound to a peer slot.
    pub fn bind(&mut self, addr: PeerId) {
        self.bound.insert(addr);
    }

    /// Release a candidate from its peer slot.
    pub fn unbind(&mut self, addr: &PeerId) {
        self.bound.remove(addr);
    }

    /// Whether a candidate is currently bound to a peer slot.
    pub fn is_bound(&self, addr: &PeerId) -> bool {
        self.bound.contains(addr)
    }

    /// Select the highest-scoring candidate not currently bound to a peer
    /// slot. Fails when every known candidate is bound, or none is known;
    /// the caller must defer and retry on a later tick.
    pub fn best_non_peer(&mut self) -> Option<PeerId> {
        let now = self.clock.local_time();
        let tolerance = self.config.latency_tolerance;
        let rng = &mut self.rng;
        let bound = &self.bound;

        self.candidates
            .values()
            .filter(|c| !bound.contains(&c.addr))
            .map(|c| (c.addr, c.score(now, tolerance, rng.f64() * 2.)))
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(addr, _)| addr)
    }

    /// Get a candidate by address.
    pub fn get(&self, addr: &PeerId) -> Option<&Candidate> {
        self.candidates.get(addr)
    }

    /// Number of known candidates.
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}
