// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Nonce generation, nonce history tracks, and the pending Map-Request
//! table that correlates inbound replies with outstanding requests.

use crate::address::Address;
use crate::constants::LISPD_MAX_RETRANSMITS;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Process-lifetime nonce generator: `nonce = hash(process_seed,
/// now_monotonic, counter)`. Seeded once at startup from a
/// cryptographically strong source (`ring::rand`) so two daemons started
/// at the same instant still diverge; the monotonic clock and a counter
/// guarantee no two nonces from this process collide.
pub struct NonceGenerator {
    seed: u64,
    counter: AtomicU64,
    start: Instant,
}

impl NonceGenerator {
    pub fn new() -> Self {
        NonceGenerator {
            seed: random_seed(),
            counter: AtomicU64::new(0),
            start: Instant::now(),
        }
    }

    /// Generate the next non-zero 64-bit nonce. Nonce `0` is reserved for
    /// plain (non-encapsulated) Map Registers and is never returned here.
    pub fn next(&self) -> u64 {
        loop {
            let counter = self.counter.fetch_add(1, Ordering::Relaxed);
            let now_nanos = self.start.elapsed().as_nanos() as u64;
            let nonce = splitmix64(self.seed ^ now_nanos ^ counter.wrapping_mul(0x9E37_79B9_7F4A_7C15));
            if nonce != 0 {
                return nonce;
            }
        }
    }
}

impl Default for NonceGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn random_seed() -> u64 {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    let mut bytes = [0u8; 8];
    // A failure here (exhausted entropy source) is vanishingly rare and
    // not recoverable in a way that matters for nonce uniqueness; fall
    // back to the monotonic clock rather than panic the daemon.
    if rng.fill(&mut bytes).is_err() {
        return Instant::now().elapsed().as_nanos() as u64;
    }
    u64::from_le_bytes(bytes)
}

/// History of nonces sent for one outstanding request-response exchange,
/// retained across retransmits so a late reply still correlates.
#[derive(Debug, Clone, Default)]
pub struct NonceTrack {
    nonces: Vec<u64>,
    pub retransmits: u8,
}

impl NonceTrack {
    pub fn new() -> Self {
        NonceTrack {
            nonces: Vec::with_capacity(LISPD_MAX_RETRANSMITS as usize + 1),
            retransmits: 0,
        }
    }

    /// Record a freshly generated nonce for this exchange.
    pub fn push(&mut self, nonce: u64) {
        if self.nonces.len() > LISPD_MAX_RETRANSMITS as usize {
            self.nonces.remove(0);
        }
        self.nonces.push(nonce);
    }

    /// A reply matches if its nonce equals any slot in the current track.
    pub fn matches(&self, nonce: u64) -> bool {
        self.nonces.contains(&nonce)
    }

    pub fn reset(&mut self) {
        self.nonces.clear();
        self.retransmits = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.nonces.is_empty()
    }
}

/// What kind of exchange a pending Map-Request belongs to; governs the
/// retransmit timeout and retry ceiling applied to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Normal,
    Smr,
    Probe,
}

#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub eid_to_resolve: Address,
    pub source_eid: Address,
    pub retransmits_remaining: u8,
    pub next_timer: Option<u64>,
    pub map_resolver_chosen: usize,
    pub kind: RequestKind,
}

/// Table of outstanding Map-Requests, indexed by nonce for reply
/// correlation and by EID for idempotent re-resolution.
#[derive(Debug, Default)]
pub struct PendingRequestTable {
    by_nonce: HashMap<u64, PendingRequest>,
    by_eid: HashMap<String, u64>,
}

impl PendingRequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, nonce: u64, req: PendingRequest) {
        self.by_eid.insert(req.eid_to_resolve.string_form(), nonce);
        self.by_nonce.insert(nonce, req);
    }

    /// Look up by nonce, consuming (removing) the entry on a match --
    /// callers are responsible for cancelling the associated
    /// retransmission timer.
    pub fn take(&mut self, nonce: u64) -> Option<PendingRequest> {
        let req = self.by_nonce.remove(&nonce)?;
        self.by_eid.remove(&req.eid_to_resolve.string_form());
        Some(req)
    }

    pub fn get_mut(&mut self, nonce: u64) -> Option<&mut PendingRequest> {
        self.by_nonce.get_mut(&nonce)
    }

    pub fn find_by_eid(&self, eid: &Address) -> Option<u64> {
        self.by_eid.get(&eid.string_form()).copied()
    }

    pub fn len(&self) -> usize {
        self.by_nonce.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_nonce.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn generator_never_emits_zero_and_is_unique_in_a_burst() {
        let gen = NonceGenerator::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let n = gen.next();
            assert_ne!(n, 0);
            assert!(seen.insert(n), "nonce collision in a single-process burst");
        }
    }

    #[test]
    fn track_matches_any_historical_nonce() {
        let mut track = NonceTrack::new();
        track.push(1);
        track.push(2);
        track.push(3);
        assert!(track.matches(1));
        assert!(track.matches(2));
        assert!(track.matches(3));
        assert!(!track.matches(4));
    }

    #[test]
    fn track_reset_clears_history_and_retransmits() {
        let mut track = NonceTrack::new();
        track.push(1);
        track.retransmits = 3;
        track.reset();
        assert!(track.is_empty());
        assert_eq!(track.retransmits, 0);
    }

    #[test]
    fn pending_request_table_take_is_1_to_1() {
        let mut table = PendingRequestTable::new();
        let eid = Address::Ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        table.insert(
            42,
            PendingRequest {
                eid_to_resolve: eid.clone(),
                source_eid: Address::NoAddr,
                retransmits_remaining: 2,
                next_timer: None,
                map_resolver_chosen: 0,
                kind: RequestKind::Normal,
            },
        );
        assert_eq!(table.find_by_eid(&eid), Some(42));
        let taken = table.take(42).unwrap();
        assert_eq!(taken.eid_to_resolve, eid);
        assert!(table.take(42).is_none());
        assert_eq!(table.find_by_eid(&eid), None);
    }
}
