// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Locator model: one routing locator (RLOC) within a mapping's
//! locator-set, its reachability state, and its NAT status when it backs
//! a local mapping.

use crate::address::Address;
use crate::nonce::NonceTrack;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Reachability state, shared so a probe callback firing off the timer
/// wheel can flip it without taking a lock on the owning mapping.
#[derive(Debug, Clone)]
pub struct LocatorState(Arc<AtomicU8>);

const STATE_UP: u8 = 1;
const STATE_DOWN: u8 = 0;

impl LocatorState {
    pub fn up() -> Self {
        LocatorState(Arc::new(AtomicU8::new(STATE_UP)))
    }

    pub fn down() -> Self {
        LocatorState(Arc::new(AtomicU8::new(STATE_DOWN)))
    }

    pub fn is_up(&self) -> bool {
        self.0.load(Ordering::Acquire) == STATE_UP
    }

    pub fn set_up(&self) {
        self.0.store(STATE_UP, Ordering::Release);
    }

    pub fn set_down(&self) {
        self.0.store(STATE_DOWN, Ordering::Release);
    }
}

/// How a locator came to be in the locator-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocatorKind {
    Static,
    Dynamic,
    Petr,
    Local,
}

/// NAT classification of a local locator (the address this daemon itself
/// uses to send control traffic).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatStatus {
    Unknown,
    NoNat,
    Nat,
    NoInfoReply,
}

/// Extended state for a locator backing a *local* mapping: its NAT
/// classification, RTR candidates, public address once learned, and the
/// nonce tracks for the two request types the Map-Register/Info-Request
/// engines keep outstanding against it.
#[derive(Debug, Clone)]
pub struct LocalExt {
    pub nat_status: NatStatus,
    pub rtr_locators: Vec<Address>,
    pub public_addr: Option<Address>,
    pub info_request_nonces: NonceTrack,
    pub emap_register_nonces: NonceTrack,
    /// Name of the backing network interface, as reported by the
    /// platform interface-status feed (netlink on Linux). Opaque to this
    /// crate beyond string identity.
    pub interface: String,
}

impl LocalExt {
    pub fn new(interface: impl Into<String>) -> Self {
        LocalExt {
            nat_status: NatStatus::Unknown,
            rtr_locators: Vec::new(),
            public_addr: None,
            info_request_nonces: NonceTrack::new(),
            emap_register_nonces: NonceTrack::new(),
            interface: interface.into(),
        }
    }
}

/// Extended state for a locator backing a *remote* (cached) mapping: the
/// nonce of the most recently sent, not-yet-answered RLOC probe (so a
/// stale pending-request entry can be reclaimed once that probe's own
/// retry ladder gives up) and the last time a probe reply was seen.
#[derive(Debug, Clone)]
pub struct RemoteExt {
    pub probe_timer: Option<u64>,
    pub last_reply: Option<Instant>,
    pub probe_retransmits: u8,
}

impl RemoteExt {
    pub fn new() -> Self {
        RemoteExt {
            probe_timer: None,
            last_reply: None,
            probe_retransmits: 0,
        }
    }
}

impl Default for RemoteExt {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub enum LocatorExt {
    Local(LocalExt),
    Remote(RemoteExt),
}

/// A single routing locator within a mapping's locator-set.
#[derive(Debug, Clone)]
pub struct Locator {
    pub address: Address,
    /// 0..=254 usable, 255 = unused (never eligible for balancing).
    pub priority: u8,
    pub weight: u8,
    pub mpriority: u8,
    pub mweight: u8,
    pub state: LocatorState,
    pub kind: LocatorKind,
    pub extended: LocatorExt,
}

pub const PRIORITY_UNUSED: u8 = 255;

impl Locator {
    pub fn new_local(address: Address, priority: u8, weight: u8, interface: impl Into<String>) -> Self {
        Locator {
            address,
            priority,
            weight,
            mpriority: priority,
            mweight: weight,
            state: LocatorState::up(),
            kind: LocatorKind::Local,
            extended: LocatorExt::Local(LocalExt::new(interface)),
        }
    }

    pub fn new_remote(address: Address, priority: u8, weight: u8) -> Self {
        Locator {
            address,
            priority,
            weight,
            mpriority: priority,
            mweight: weight,
            state: LocatorState::up(),
            kind: LocatorKind::Dynamic,
            extended: LocatorExt::Remote(RemoteExt::new()),
        }
    }

    pub fn is_up(&self) -> bool {
        self.state.is_up()
    }

    pub fn eligible_for_balance(&self) -> bool {
        self.is_up() && self.priority != PRIORITY_UNUSED
    }

    pub fn local_ext(&self) -> Option<&LocalExt> {
        match &self.extended {
            LocatorExt::Local(ext) => Some(ext),
            LocatorExt::Remote(_) => None,
        }
    }

    pub fn local_ext_mut(&mut self) -> Option<&mut LocalExt> {
        match &mut self.extended {
            LocatorExt::Local(ext) => Some(ext),
            LocatorExt::Remote(_) => None,
        }
    }

    pub fn remote_ext(&self) -> Option<&RemoteExt> {
        match &self.extended {
            LocatorExt::Remote(ext) => Some(ext),
            LocatorExt::Local(_) => None,
        }
    }

    pub fn remote_ext_mut(&mut self) -> Option<&mut RemoteExt> {
        match &mut self.extended {
            LocatorExt::Remote(ext) => Some(ext),
            LocatorExt::Local(_) => None,
        }
    }
}
