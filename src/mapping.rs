// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Mapping & locator-set operations: adding locators, re-sorting a
//! family's locator list after an address change, and recomputing the
//! per-mapping load-balancing vectors (RFC 6830 Section 6.3.3-style
//! weighted locator selection, ported from `lispd_mapping.c`'s
//! `calculate_balancing_vectors`).

use crate::address::{Address, Family};
use crate::locator::Locator;
use crate::nonce::NonceTrack;
use std::time::Instant;

/// Negative/positive cache action and local-registration bookkeeping are
/// mutually exclusive lifecycles for a mapping.
#[derive(Debug, Clone)]
pub enum MappingLifecycle {
    Local(LocalRegState),
    Cache(CacheState),
}

#[derive(Debug, Clone, Default)]
pub struct LocalRegState {
    pub retransmits: u8,
    pub nonce_track: NonceTrack,
    pub registered: bool,
}

#[derive(Debug, Clone)]
pub struct CacheState {
    pub installed_at: Instant,
    pub ttl_timer: Option<u64>,
    pub negative: bool,
}

impl CacheState {
    pub fn new() -> Self {
        CacheState {
            installed_at: Instant::now(),
            ttl_timer: None,
            negative: false,
        }
    }
}

/// Negative/positive cache-entry action, mirrored from the control
/// message's `action` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    NoAction,
    NativeForward,
    SendMapRequest,
    Drop,
}

impl Action {
    pub fn from_wire(v: u8) -> Self {
        match v {
            1 => Action::NativeForward,
            2 => Action::SendMapRequest,
            3 => Action::Drop,
            _ => Action::NoAction,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Action::NoAction => 0,
            Action::NativeForward => 1,
            Action::SendMapRequest => 2,
            Action::Drop => 3,
        }
    }
}

/// A reference into one of a mapping's per-family locator lists. Rust
/// has no pointer-stable way to borrow into a sibling field across a
/// struct, so the balancing vector is a list of these indices rather than
/// the raw locator pointers `lispd_mapping.c` used -- they must still be
/// rebuilt, never reused, whenever the parent's locator set changes,
/// since an index is only valid against the list shape it was computed
/// from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocatorRef {
    pub family: Family,
    pub index: usize,
}

#[derive(Debug, Clone, Default)]
pub struct BalancingVectors {
    pub v4: Vec<LocatorRef>,
    pub v6: Vec<LocatorRef>,
    pub combined: Vec<LocatorRef>,
}

/// EID prefix -> locator-set mapping.
#[derive(Debug, Clone)]
pub struct Mapping {
    pub eid: Address,
    pub plen: u8,
    pub iid: u32,
    pub locators_v4: Vec<Locator>,
    pub locators_v6: Vec<Locator>,
    pub action: Action,
    pub authoritative: bool,
    pub ttl_seconds: u32,
    pub balance: BalancingVectors,
    pub lifecycle: MappingLifecycle,
}

impl Mapping {
    pub fn new_local(eid: Address, plen: u8, iid: u32) -> Self {
        Mapping {
            eid,
            plen,
            iid,
            locators_v4: Vec::new(),
            locators_v6: Vec::new(),
            action: Action::NoAction,
            authoritative: true,
            ttl_seconds: 1440 * 60,
            balance: BalancingVectors::default(),
            lifecycle: MappingLifecycle::Local(LocalRegState::default()),
        }
    }

    pub fn new_cache(eid: Address, plen: u8, iid: u32, ttl_seconds: u32) -> Self {
        Mapping {
            eid,
            plen,
            iid,
            locators_v4: Vec::new(),
            locators_v6: Vec::new(),
            action: Action::NoAction,
            authoritative: false,
            ttl_seconds,
            balance: BalancingVectors::default(),
            lifecycle: MappingLifecycle::Cache(CacheState::new()),
        }
    }

    pub fn locator_count(&self) -> u16 {
        (self.locators_v4.len() + self.locators_v6.len()) as u16
    }

    fn family_of(locator: &Locator) -> Option<Family> {
        locator.address.family()
    }

    fn family_list_mut(&mut self, family: Family) -> &mut Vec<Locator> {
        match family {
            Family::V4 => &mut self.locators_v4,
            Family::V6 => &mut self.locators_v6,
        }
    }

    fn family_list(&self, family: Family) -> &Vec<Locator> {
        match family {
            Family::V4 => &self.locators_v4,
            Family::V6 => &self.locators_v6,
        }
    }

    /// Route `locator` to the correct family list, rejecting an exact
    /// address duplicate. On success, recomputes the balancing vectors.
    pub fn add_locator(&mut self, locator: Locator) -> Result<(), crate::error::LispError> {
        let family = Self::family_of(&locator).ok_or(crate::error::LispError::AllocFailure(
            "locator address has no routable family".into(),
        ))?;
        {
            let list = self.family_list(family);
            if list.iter().any(|l| l.address == locator.address) {
                return Err(crate::error::LispError::AlreadyExists);
            }
        }
        let list = self.family_list_mut(family);
        let pos = list
            .iter()
            .position(|l| Address::compare(&l.address, &locator.address) == std::cmp::Ordering::Greater)
            .unwrap_or(list.len());
        list.insert(pos, locator);
        self.recompute_balance();
        Ok(())
    }

    /// Re-order the family list containing `changed_addr`'s new value so
    /// that locators stay in ascending address order. Single linear pass:
    /// find the moved node, remove it, find its new predecessor by a
    /// second linear scan over the remaining (already-sorted) elements,
    /// and splice it back in.
    pub fn sort_locators_on_change(&mut self, family: Family, changed_index: usize) {
        let list = self.family_list_mut(family);
        if changed_index >= list.len() {
            return;
        }
        let moved = list.remove(changed_index);
        let pos = list
            .iter()
            .position(|l| Address::compare(&l.address, &moved.address) == std::cmp::Ordering::Greater)
            .unwrap_or(list.len());
        list.insert(pos, moved);
        self.recompute_balance();
    }

    /// Recompute the v4-only, v6-only, and combined load-balancing
    /// vectors from the current locator-set.
    ///
    /// 1. For each family, select the UP locators at the best (lowest)
    ///    priority observed.
    /// 2. Weight-replicate: each locator appears `weight / gcd(weights)`
    ///    times, or once each if every selected locator has weight 0.
    /// 3. Combine: if the two families' best priorities tie, concatenate
    ///    and re-derive a combined vector with `gcd(gcd_v4, gcd_v6)`;
    ///    otherwise alias whichever family has the better (lower)
    ///    minimum priority.
    pub fn recompute_balance(&mut self) {
        let (v4_vec, v4_min_prio, v4_gcd) = build_family_vector(&self.locators_v4, Family::V4);
        let (v6_vec, v6_min_prio, v6_gcd) = build_family_vector(&self.locators_v6, Family::V6);

        let combined = match (v4_min_prio, v6_min_prio) {
            (Some(p4), Some(p6)) if p4 == p6 => {
                let g = gcd(v4_gcd, v6_gcd);
                let mut combined = Vec::new();
                replicate_into(&self.locators_v4, Family::V4, p4, g, &mut combined);
                replicate_into(&self.locators_v6, Family::V6, p6, g, &mut combined);
                combined
            }
            (Some(p4), Some(p6)) if p4 < p6 => v4_vec.clone(),
            (Some(_), Some(_)) => v6_vec.clone(),
            (Some(_), None) => v4_vec.clone(),
            (None, Some(_)) => v6_vec.clone(),
            (None, None) => Vec::new(),
        };

        self.balance = BalancingVectors {
            v4: v4_vec,
            v6: v6_vec,
            combined,
        };
    }
}

fn min_priority(locators: &[Locator]) -> Option<u8> {
    locators
        .iter()
        .filter(|l| l.eligible_for_balance())
        .map(|l| l.priority)
        .min()
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

fn gcd_of_weights(locators: &[&Locator]) -> u32 {
    locators
        .iter()
        .map(|l| l.weight as u32)
        .fold(0, gcd)
}

/// Build one family's balancing vector plus its best priority and the
/// gcd of the selected subset's weights (needed by the caller to derive
/// the combined vector without recomputing the subset).
fn build_family_vector(locators: &[Locator], family: Family) -> (Vec<LocatorRef>, Option<u8>, u32) {
    let best = match min_priority(locators) {
        Some(p) => p,
        None => return (Vec::new(), None, 0),
    };
    let subset: Vec<&Locator> = locators
        .iter()
        .filter(|l| l.eligible_for_balance() && l.priority == best)
        .collect();
    let g = gcd_of_weights(&subset);
    let mut out = Vec::new();
    replicate_into(locators, family, best, g, &mut out);
    (out, Some(best), g)
}

fn replicate_into(locators: &[Locator], family: Family, best_priority: u8, gcd: u32, out: &mut Vec<LocatorRef>) {
    let subset_indices: Vec<usize> = locators
        .iter()
        .enumerate()
        .filter(|(_, l)| l.eligible_for_balance() && l.priority == best_priority)
        .map(|(i, _)| i)
        .collect();
    let total_weight: u32 = subset_indices.iter().map(|&i| locators[i].weight as u32).sum();
    if total_weight == 0 || gcd == 0 {
        for i in subset_indices {
            out.push(LocatorRef { family, index: i });
        }
        return;
    }
    for i in subset_indices {
        let reps = (locators[i].weight as u32 / gcd).max(1);
        for _ in 0..reps {
            out.push(LocatorRef { family, index: i });
        }
    }
}
