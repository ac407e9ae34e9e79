// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RLOC-probing and SMR engine: periodic reachability probing of cached
//! locators (with down-detection after a bounded run of unanswered
//! probes), and interface-change-triggered Solicit-Map-Request fan-out to
//! recently-seen peers.
//!
//! Both mechanisms send unicast Map-Requests directly to a peer rather
//! than through the map-resolver chain [`crate::resolver`] uses for
//! ordinary resolution, and neither rides that module's generic
//! retransmission ladder: a timed-out probe must mark a locator down, not
//! poison the cache with a negative entry for its address, and a timed-out
//! SMR has no failure consequence at all -- it is advisory. Each mechanism
//! therefore keeps its own retry counters (`RemoteExt::probe_retransmits`
//! and the `remaining` field carried in [`TimerEvent::SmrRetry`]) instead
//! of reusing [`crate::nonce::PendingRequestTable`]'s retransmit machinery.
//!
//! A probe's nonce is still registered into the pending-request table
//! (with no retransmit timer of its own) purely so a genuine Map-Reply
//! correlates against it and runs [`crate::resolver::on_map_reply`]'s
//! ordinary locator-up bookkeeping. The nonce is mirrored into
//! [`crate::locator::RemoteExt::probe_timer`] so the next tick can reclaim
//! it if no reply ever arrived, keeping that table from growing without
//! bound.

use std::net::SocketAddr;
use std::time::Duration;

use crate::address::{Address, Family};
use crate::constants::{
    DEFAULT_RLOC_PROBING_RETRIES, DEFAULT_RLOC_PROBING_RETRIES_INTERVAL, LISPD_INITIAL_SMR_TIMEOUT,
    LISPD_MAX_SMR_RETRANSMIT, LISPD_SMR_TIMEOUT, LISP_CONTROL_PORT, RLOC_PROBING_INTERVAL,
};
use crate::cursor::CursorMut;
use crate::daemon::{locator_timer, smr_retry_timer, Daemon, MappingKey, TimerEvent};
use crate::mapping::Mapping;
use crate::nonce::{PendingRequest, RequestKind};
use crate::protocol::map_request::{EidRecord, MapRequest, RequestFlags};
use crate::{register, resolver};

/// Arm a steady-cadence probe timer for every up locator already present
/// in the cache. Only ever finds work to do if a daemon is reconstructed
/// against a non-empty cache (there is none at first startup); kept so
/// the probing engine doesn't depend on every locator having arrived via
/// [`crate::resolver::on_map_reply`].
pub fn schedule_startup(daemon: &mut Daemon) {
    let mut targets = Vec::new();
    for family in [Family::V4, Family::V6] {
        daemon.cache.walk(family, &mut |m: &Mapping| {
            let Some(key) = MappingKey::of(&m.eid, m.plen) else {
                return;
            };
            for loc in m.locators_v4.iter().chain(m.locators_v6.iter()) {
                if loc.is_up() {
                    targets.push((key, loc.address.string_form()));
                }
            }
        });
    }
    for (key, addr) in targets {
        arm_steady(daemon, key, addr);
    }
}

/// (Re)arm the steady RLOC-probing interval for one cached locator. Safe
/// to call unconditionally -- [`crate::timer::TimerWheel::start`] replaces
/// any schedule already in flight for this handle, so both first
/// installation ([`crate::resolver::on_map_reply`]) and a reply resetting
/// the locator back to the slow cadence route through here.
pub fn arm_steady(daemon: &mut Daemon, mapping: MappingKey, locator_addr: String) {
    arm(daemon, mapping, locator_addr, Duration::from_secs(RLOC_PROBING_INTERVAL));
}

fn arm(daemon: &mut Daemon, mapping: MappingKey, locator_addr: String, delay: Duration) {
    let probe_key = (mapping, locator_addr.clone());
    let handle = locator_timer(&mut daemon.probe_handles, &mut daemon.timers, &probe_key);
    daemon.timers.start(handle, delay, TimerEvent::Probe { mapping, locator_addr });
}

/// Netlink reported a link or address change. Debounce: repeated events
/// within [`LISPD_SMR_TIMEOUT`] just keep pushing the single shared
/// `smr_handle` back out, so a flapping interface triggers one SMR round
/// once things settle rather than one per event.
pub fn on_interface_event(daemon: &mut Daemon) {
    daemon.timers.start(daemon.smr_handle, Duration::from_secs(LISPD_SMR_TIMEOUT), TimerEvent::SmrDebounce);
}

/// Debounce settled: rebalance every local mapping (an interface coming
/// back up or going down can change which locators are eligible) and emit
/// an SMR to every peer we've recently heard from, for every EID we
/// register ourselves.
pub fn on_smr_debounce(daemon: &mut Daemon) {
    rebalance_local_mappings(daemon);
    emit_smr(daemon);
}

fn rebalance_local_mappings(daemon: &mut Daemon) {
    for key in register::local_mapping_keys(daemon) {
        if let Ok(mapping) = daemon.local_db.lookup_exact_mut(key.family, key.prefix, key.plen) {
            mapping.recompute_balance();
        }
    }
}

fn emit_smr(daemon: &mut Daemon) {
    let eids: Vec<Address> = register::local_mapping_keys(daemon)
        .into_iter()
        .map(|key| Address::IpPrefix(key.prefix, key.plen))
        .collect();
    let peers = daemon.recent_peers.clone();
    if eids.is_empty() || peers.is_empty() {
        return;
    }
    for eid in eids {
        for &peer in &peers {
            let nonce = daemon.nonce_gen.next();
            send_smr_request(daemon, &eid, peer, nonce);
            arm_smr_retry(daemon, eid.clone(), peer, LISPD_MAX_SMR_RETRANSMIT);
        }
    }
}

fn send_smr_request(daemon: &Daemon, eid: &Address, peer: SocketAddr, nonce: u64) {
    let req = MapRequest {
        flags: RequestFlags {
            smr: true,
            ..Default::default()
        },
        nonce,
        source_eid: resolver::local_source_eid(daemon, eid.family()),
        itr_rlocs: resolver::collect_itr_rlocs(daemon),
        records: vec![EidRecord {
            mask_len: eid.plen(),
            eid: eid.clone(),
        }],
    };
    let mut buf = vec![0u8; req.size_on_wire()];
    {
        let mut w = CursorMut::new(&mut buf);
        if let Err(e) = req.write_to(&mut w) {
            log::warn!("failed to encode smr map-request for {}: {e}", eid.string_form());
            return;
        }
    }
    if let Err(e) = daemon.send_to(peer, &buf) {
        log::warn!("failed to send smr map-request to {peer}: {e}");
    }
}

fn arm_smr_retry(daemon: &mut Daemon, eid: Address, peer: SocketAddr, remaining: u8) {
    let Some(key) = MappingKey::of(&eid, eid.plen()) else {
        return;
    };
    let retry_key = (key, peer);
    let handle = smr_retry_timer(&mut daemon.smr_retry_handles, &mut daemon.timers, &retry_key);
    daemon
        .timers
        .start(handle, Duration::from_secs(LISPD_INITIAL_SMR_TIMEOUT), TimerEvent::SmrRetry { eid, peer, remaining });
}

/// SMR has no reply to correlate against; a timed-out retry just resends
/// up to `remaining` times and then gives up silently. Worst case the
/// peer never re-resolves until its own cache entry expires on TTL.
pub fn on_smr_retry(daemon: &mut Daemon, eid: Address, peer: SocketAddr, remaining: u8) {
    if let Some(key) = MappingKey::of(&eid, eid.plen()) {
        daemon.smr_retry_handles.remove(&(key, peer));
    }

    if remaining == 0 {
        log::debug!("giving up smr retransmission of {} to {peer}", eid.string_form());
        return;
    }

    let nonce = daemon.nonce_gen.next();
    send_smr_request(daemon, &eid, peer, nonce);
    arm_smr_retry(daemon, eid.clone(), peer, remaining - 1);
}

/// Steady-cadence or failure-retry tick for one cached locator.
///
/// `probe_retransmits` doubles as the state: `0` means the last probe (if
/// any) was answered or none is outstanding yet, so this tick starts a
/// fresh round; `1..=DEFAULT_RLOC_PROBING_RETRIES` means a prior probe in
/// this round went unanswered and this is a fast retry; exceeding
/// `DEFAULT_RLOC_PROBING_RETRIES` means the whole round went unanswered
/// and the locator is declared down.
pub fn on_probe_tick(daemon: &mut Daemon, mapping: MappingKey, locator_addr: String) {
    let probe_key = (mapping, locator_addr.clone());

    let outcome = {
        let lookup = daemon.cache.lookup_exact_mut(mapping.family, mapping.prefix, mapping.plen);
        match lookup {
            Err(_) => None,
            Ok(m) => {
                let mut outcome = None;
                for loc in m.locators_v4.iter_mut().chain(m.locators_v6.iter_mut()) {
                    if loc.address.string_form() != locator_addr {
                        continue;
                    }
                    let stale_nonce = loc.remote_ext_mut().and_then(|ext| ext.probe_timer.take());
                    let Some(ext) = loc.remote_ext_mut() else {
                        break;
                    };
                    ext.probe_retransmits = ext.probe_retransmits.saturating_add(1);
                    let give_up = ext.probe_retransmits > DEFAULT_RLOC_PROBING_RETRIES;
                    if give_up {
                        loc.state.set_down();
                        if let Some(ext) = loc.remote_ext_mut() {
                            ext.probe_retransmits = 0;
                        }
                    }
                    outcome = Some((loc.address.clone(), stale_nonce, give_up));
                    break;
                }
                if matches!(outcome, Some((_, _, true))) {
                    m.recompute_balance();
                }
                outcome
            }
        }
    };

    let Some((addr, stale_nonce, give_up)) = outcome else {
        daemon.probe_handles.remove(&probe_key);
        return;
    };

    if let Some(nonce) = stale_nonce {
        daemon.pending.take(nonce);
    }

    if give_up {
        log::warn!(
            "locator {} of {}/{} marked down after {} unanswered probes",
            addr.string_form(),
            mapping.prefix,
            mapping.plen,
            DEFAULT_RLOC_PROBING_RETRIES
        );
        arm_steady(daemon, mapping, locator_addr);
        return;
    }

    let nonce = send_probe(daemon, &mapping, &addr);
    store_probe_nonce(daemon, mapping, &locator_addr, nonce);
    arm(daemon, mapping, locator_addr, Duration::from_secs(DEFAULT_RLOC_PROBING_RETRIES_INTERVAL));
}

fn send_probe(daemon: &mut Daemon, mapping: &MappingKey, locator: &Address) -> u64 {
    let nonce = daemon.nonce_gen.next();
    let req = MapRequest {
        flags: RequestFlags {
            probe: true,
            ..Default::default()
        },
        nonce,
        source_eid: resolver::local_source_eid(daemon, Some(mapping.family)),
        itr_rlocs: resolver::collect_itr_rlocs(daemon),
        records: vec![EidRecord {
            mask_len: mapping.plen,
            eid: Address::IpPrefix(mapping.prefix, mapping.plen),
        }],
    };
    let dst = SocketAddr::new(locator.ip(), LISP_CONTROL_PORT);
    let mut buf = vec![0u8; req.size_on_wire()];
    {
        let mut w = CursorMut::new(&mut buf);
        if let Err(e) = req.write_to(&mut w) {
            log::warn!("failed to encode rloc-probe for {}: {e}", locator.string_form());
            return nonce;
        }
    }
    if let Err(e) = daemon.send_to(dst, &buf) {
        log::warn!("failed to send rloc-probe to {dst}: {e}");
    }

    // Registered with no retransmit timer: this entry exists only so a
    // genuine reply correlates through `resolver::on_map_reply`. The
    // locator's own address (not the mapping's EID) is the dedup key here,
    // so it can't collide with an unrelated, real resolution in flight for
    // that EID.
    daemon.pending.insert(
        nonce,
        PendingRequest {
            eid_to_resolve: locator.clone(),
            source_eid: Address::NoAddr,
            retransmits_remaining: 0,
            next_timer: None,
            map_resolver_chosen: 0,
            kind: RequestKind::Probe,
        },
    );

    nonce
}

fn store_probe_nonce(daemon: &mut Daemon, mapping: MappingKey, locator_addr: &str, nonce: u64) {
    let Ok(m) = daemon.cache.lookup_exact_mut(mapping.family, mapping.prefix, mapping.plen) else {
        return;
    };
    for loc in m.locators_v4.iter_mut().chain(m.locators_v6.iter_mut()) {
        if loc.address.string_form() == locator_addr {
            if let Some(ext) = loc.remote_ext_mut() {
                ext.probe_timer = Some(nonce);
            }
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::config::Config;
    use crate::daemon::Daemon;
    use crate::locator::Locator;
    use crate::mapping::Mapping;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_daemon() -> Daemon {
        Daemon::new_for_test(Config::default()).expect("ephemeral bind should succeed in a test sandbox")
    }

    fn cache_mapping_with_one_locator(daemon: &mut Daemon) -> (MappingKey, String) {
        let eid = Address::IpPrefix(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 0)), 24);
        let mut mapping = Mapping::new_cache(eid.clone(), 24, 0, 180);
        let locator_addr = Address::Ip(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)));
        let locator = Locator::new_remote(locator_addr.clone(), 1, 50);
        let _ = mapping.add_locator(locator);
        daemon
            .cache
            .install_or_refresh(Family::V4, eid.ip(), 24, mapping)
            .unwrap();
        (MappingKey::of(&eid, 24).unwrap(), locator_addr.string_form())
    }

    #[test]
    fn probe_tick_marks_locator_down_after_exhausting_retries() {
        let mut daemon = test_daemon();
        let (key, locator_addr) = cache_mapping_with_one_locator(&mut daemon);

        for _ in 0..=DEFAULT_RLOC_PROBING_RETRIES {
            on_probe_tick(&mut daemon, key, locator_addr.clone());
        }

        let mapping = daemon.cache.lookup_exact(key.family, key.prefix, key.plen).unwrap();
        let loc = mapping.locators_v4.iter().find(|l| l.address.string_form() == locator_addr).unwrap();
        assert!(!loc.is_up());
        assert_eq!(loc.remote_ext().unwrap().probe_retransmits, 0);
    }

    #[test]
    fn probe_tick_reclaims_the_prior_round_nonce() {
        let mut daemon = test_daemon();
        let (key, locator_addr) = cache_mapping_with_one_locator(&mut daemon);

        on_probe_tick(&mut daemon, key, locator_addr.clone());
        assert_eq!(daemon.pending.len(), 1);

        on_probe_tick(&mut daemon, key, locator_addr);
        assert_eq!(daemon.pending.len(), 1, "stale nonce from the first tick must be reclaimed, not leaked");
    }

    #[test]
    fn probe_tick_on_a_since_evicted_locator_clears_its_handle() {
        let mut daemon = test_daemon();
        let (key, locator_addr) = cache_mapping_with_one_locator(&mut daemon);
        arm_steady(&mut daemon, key, locator_addr.clone());
        daemon.cache.expire(key.family, key.prefix, key.plen);

        on_probe_tick(&mut daemon, key, locator_addr);
        assert!(daemon.probe_handles.is_empty());
    }

    #[test]
    fn interface_event_debounces_into_one_smr_round() {
        let mut daemon = test_daemon();
        daemon.recent_peers.push(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)), LISP_CONTROL_PORT));

        on_interface_event(&mut daemon);
        assert!(daemon.timers.is_scheduled(daemon.smr_handle));
        on_interface_event(&mut daemon);
        assert!(daemon.timers.is_scheduled(daemon.smr_handle));
    }

    #[test]
    fn smr_retry_gives_up_silently_once_exhausted() {
        let mut daemon = test_daemon();
        let eid = Address::IpPrefix(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 0)), 24);
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)), LISP_CONTROL_PORT);

        on_smr_retry(&mut daemon, eid.clone(), peer, 0);
        let key = MappingKey::of(&eid, 24).unwrap();
        assert!(!daemon.smr_retry_handles.contains_key(&(key, peer)));
    }
}
