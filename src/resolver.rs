// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Map Request / Map Reply engine: cache-miss resolution, inbound reply
//! correlation against the pending-request table, answering Map-Requests
//! this daemon is authoritative for, and the receiver side of SMR.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::address::{Address, Family};
use crate::constants::{
    LISPD_INITIAL_MRQ_TIMEOUT, LISPD_INITIAL_PROBE_TIMEOUT, LISPD_INITIAL_SMR_TIMEOUT, LISPD_MAX_MR_RETRANSMIT,
    LISPD_MAX_PROBE_RETRANSMIT, LISPD_MAX_SMR_RETRANSMIT, LISP_CONTROL_PORT,
};
use crate::cursor::CursorMut;
use crate::daemon::{mapping_timer, Daemon, MappingKey, TimerEvent};
use crate::locator::Locator;
use crate::mapping::{Mapping, MappingLifecycle};
use crate::nonce::{PendingRequest, RequestKind};
use crate::protocol::map_reply::{MapReply, ReplyFlags};
use crate::protocol::map_request::{EidRecord, MapRequest, RequestFlags};
use crate::protocol::record::{LocatorRecord, MappingRecord};
use crate::timer::TimerHandle;

/// Resolve `eid_to_resolve`: a cache hit returns immediately, a miss
/// issues a Map-Request toward the next map resolver in round-robin order
/// and arms a retransmission timer.
pub fn resolve(daemon: &mut Daemon, eid_to_resolve: Address) {
    let Some(family) = eid_to_resolve.family() else {
        return;
    };
    if daemon.cache.lookup_best(family, eid_to_resolve.ip()).is_ok() {
        return;
    }
    if daemon.pending.find_by_eid(&eid_to_resolve).is_some() {
        return;
    }
    send_new_request(daemon, eid_to_resolve, RequestKind::Normal);
}

fn max_retransmits(kind: RequestKind) -> u8 {
    match kind {
        RequestKind::Normal => LISPD_MAX_MR_RETRANSMIT,
        RequestKind::Smr => LISPD_MAX_SMR_RETRANSMIT,
        RequestKind::Probe => LISPD_MAX_PROBE_RETRANSMIT,
    }
}

fn initial_timeout(kind: RequestKind) -> u64 {
    match kind {
        RequestKind::Normal => LISPD_INITIAL_MRQ_TIMEOUT,
        RequestKind::Smr => LISPD_INITIAL_SMR_TIMEOUT,
        RequestKind::Probe => LISPD_INITIAL_PROBE_TIMEOUT,
    }
}

pub(crate) fn collect_itr_rlocs(daemon: &Daemon) -> Vec<Address> {
    let mut addrs: Vec<Address> = Vec::new();
    daemon.local_db.walk(Family::V4, &mut |m| {
        for loc in &m.locators_v4 {
            if !addrs.contains(&loc.address) {
                addrs.push(loc.address.clone());
            }
        }
    });
    daemon.local_db.walk(Family::V6, &mut |m| {
        for loc in &m.locators_v6 {
            if !addrs.contains(&loc.address) {
                addrs.push(loc.address.clone());
            }
        }
    });
    addrs
}

pub(crate) fn local_source_eid(daemon: &Daemon, family: Option<Family>) -> Address {
    let Some(family) = family else {
        return Address::NoAddr;
    };
    let mut found = None;
    daemon.local_db.walk(family, &mut |m| {
        if found.is_none() {
            found = Some(m.eid.clone());
        }
    });
    found.unwrap_or(Address::NoAddr)
}

fn send_request_wire(daemon: &Daemon, req: &MapRequest, resolver_addr: IpAddr) {
    let dst = SocketAddr::new(resolver_addr, LISP_CONTROL_PORT);
    let mut buf = vec![0u8; req.size_on_wire()];
    {
        let mut w = CursorMut::new(&mut buf);
        if let Err(e) = req.write_to(&mut w) {
            log::warn!("failed to encode map-request for {}: {e}", req.records.first().map(|r| r.eid.string_form()).unwrap_or_default());
            return;
        }
    }
    if let Err(e) = daemon.send_to(dst, &buf) {
        log::warn!("failed to send map-request to {dst}: {e}");
    }
}

/// Build and send a fresh Map-Request (new nonce, new pending-request
/// entry), regardless of whether a cache entry already exists. Used both
/// by [`resolve`] on a cache miss and by the SMR-receiver path, which
/// must re-resolve even though a (now possibly stale) cache entry is
/// already present.
fn send_new_request(daemon: &mut Daemon, eid_to_resolve: Address, kind: RequestKind) {
    if daemon.config.map_resolvers.is_empty() {
        log::warn!("cannot resolve {}: no map resolvers configured", eid_to_resolve.string_form());
        return;
    }
    let resolver_idx = daemon.next_resolver % daemon.config.map_resolvers.len();
    daemon.next_resolver = (daemon.next_resolver + 1) % daemon.config.map_resolvers.len();
    let resolver_addr = daemon.config.map_resolvers[resolver_idx];

    let nonce = daemon.nonce_gen.next();
    let source_eid = local_source_eid(daemon, eid_to_resolve.family());
    let itr_rlocs = collect_itr_rlocs(daemon);

    let wire_req = MapRequest {
        flags: RequestFlags {
            smr: matches!(kind, RequestKind::Smr),
            ..Default::default()
        },
        nonce,
        source_eid: source_eid.clone(),
        itr_rlocs,
        records: vec![EidRecord {
            mask_len: eid_to_resolve.plen(),
            eid: eid_to_resolve.clone(),
        }],
    };
    send_request_wire(daemon, &wire_req, resolver_addr);

    let timer_handle = daemon.timers.new_handle();
    let pending = PendingRequest {
        eid_to_resolve: eid_to_resolve.clone(),
        source_eid,
        retransmits_remaining: max_retransmits(kind),
        next_timer: Some(timer_handle.0),
        map_resolver_chosen: resolver_idx,
        kind,
    };
    daemon.pending.insert(nonce, pending);
    daemon
        .timers
        .start(timer_handle, Duration::from_secs(initial_timeout(kind)), TimerEvent::ResolverRetry(nonce));
}

/// Retransmission tick for an outstanding resolution. Reuses the original
/// nonce across retransmits, matching the nonce-as-history-array model
/// the rest of this daemon uses for retried requests.
pub fn on_retry(daemon: &mut Daemon, nonce: u64) {
    let Some(retransmits_remaining) = daemon.pending.get_mut(nonce).map(|r| r.retransmits_remaining) else {
        return;
    };

    if retransmits_remaining == 0 {
        let req = daemon.pending.take(nonce).expect("retransmit count observed above");
        log::warn!("giving up resolving {} after exhausting retransmits", req.eid_to_resolve.string_form());
        install_negative_entry(daemon, &req.eid_to_resolve);
        return;
    }

    let (kind, resolver_idx, eid_to_resolve, source_eid) = {
        let req = daemon.pending.get_mut(nonce).expect("retransmit count observed above");
        req.retransmits_remaining -= 1;
        (req.kind, req.map_resolver_chosen, req.eid_to_resolve.clone(), req.source_eid.clone())
    };

    let Some(&resolver_addr) = daemon.config.map_resolvers.get(resolver_idx) else {
        daemon.pending.take(nonce);
        return;
    };

    let itr_rlocs = collect_itr_rlocs(daemon);
    let wire_req = MapRequest {
        flags: RequestFlags {
            smr: matches!(kind, RequestKind::Smr),
            ..Default::default()
        },
        nonce,
        source_eid,
        itr_rlocs,
        records: vec![EidRecord {
            mask_len: eid_to_resolve.plen(),
            eid: eid_to_resolve.clone(),
        }],
    };
    send_request_wire(daemon, &wire_req, resolver_addr);

    let handle = daemon.timers.new_handle();
    if let Some(req) = daemon.pending.get_mut(nonce) {
        req.next_timer = Some(handle.0);
    }
    daemon
        .timers
        .start(handle, Duration::from_secs(initial_timeout(kind)), TimerEvent::ResolverRetry(nonce));
}

fn install_negative_entry(daemon: &mut Daemon, eid: &Address) {
    if !daemon.config.negative_cache_on_timeout {
        return;
    }
    let Some(family) = eid.family() else {
        return;
    };
    let plen = eid.plen();
    let mut negative = Mapping::new_cache(eid.clone(), plen, 0, daemon.config.negative_ttl_seconds);
    negative.action = crate::mapping::Action::NativeForward;
    if let MappingLifecycle::Cache(cs) = &mut negative.lifecycle {
        cs.negative = true;
    }
    let key = MappingKey {
        family,
        prefix: eid.ip(),
        plen,
    };
    if daemon
        .cache
        .install_or_refresh(family, eid.ip(), plen, negative)
        .is_ok()
    {
        arm_expire(daemon, key, daemon.config.negative_ttl_seconds);
    }
}

fn arm_expire(daemon: &mut Daemon, key: MappingKey, ttl_seconds: u32) {
    if ttl_seconds == 0 {
        return;
    }
    let handle = mapping_timer(&mut daemon.expire_handles, &mut daemon.timers, &key);
    daemon
        .timers
        .start(handle, Duration::from_secs(ttl_seconds as u64), TimerEvent::CacheExpire(key));
}

/// Inbound Map-Reply. A nonce that doesn't match an outstanding request
/// is a stale or spoofed reply and is dropped without further parsing of
/// its records.
pub fn on_map_reply(daemon: &mut Daemon, rep: MapReply) {
    let Some(req) = daemon.pending.take(rep.nonce) else {
        log::debug!("dropping map-reply with unrecognized nonce {}", rep.nonce);
        return;
    };
    if let Some(h) = req.next_timer {
        daemon.timers.cancel(TimerHandle(h));
    }

    for record in &rep.records {
        let Some(family) = record.eid.family() else {
            continue;
        };
        let key = MappingKey {
            family,
            prefix: record.eid.ip(),
            plen: record.mask_len,
        };

        if record.locators.is_empty() {
            install_negative_reply_entry(daemon, record, key);
            continue;
        }

        install_positive_reply_entry(daemon, record, key);

        if rep.flags.probe {
            for loc_rec in &record.locators {
                if loc_rec.probed {
                    mark_locator_up(daemon, &key, &loc_rec.address);
                }
            }
        }
    }
}

fn install_negative_reply_entry(daemon: &mut Daemon, record: &MappingRecord, key: MappingKey) {
    let mut negative = Mapping::new_cache(record.eid.clone(), record.mask_len, 0, record.ttl);
    negative.action = record.action;
    negative.authoritative = record.authoritative;
    if let MappingLifecycle::Cache(cs) = &mut negative.lifecycle {
        cs.negative = true;
    }
    if daemon
        .cache
        .install_or_refresh(key.family, key.prefix, key.plen, negative)
        .is_ok()
    {
        arm_expire(daemon, key, record.ttl);
    }
}

fn install_positive_reply_entry(daemon: &mut Daemon, record: &MappingRecord, key: MappingKey) {
    let mut mapping = Mapping::new_cache(record.eid.clone(), record.mask_len, 0, record.ttl);
    mapping.action = record.action;
    mapping.authoritative = record.authoritative;
    for loc_rec in &record.locators {
        let mut locator = Locator::new_remote(loc_rec.address.clone(), loc_rec.priority, loc_rec.weight);
        locator.mpriority = loc_rec.mpriority;
        locator.mweight = loc_rec.mweight;
        if !loc_rec.reachable {
            locator.state.set_down();
        }
        let _ = mapping.add_locator(locator);
    }
    mapping.recompute_balance();
    let locator_addrs: Vec<String> = mapping
        .locators_v4
        .iter()
        .chain(mapping.locators_v6.iter())
        .map(|l| l.address.string_form())
        .collect();
    if daemon
        .cache
        .install_or_refresh(key.family, key.prefix, key.plen, mapping)
        .is_ok()
    {
        arm_expire(daemon, key, record.ttl);
        for addr in locator_addrs {
            crate::probe::arm_steady(daemon, key, addr);
        }
    }
}

fn mark_locator_up(daemon: &mut Daemon, key: &MappingKey, addr: &Address) {
    let Some(loc_family) = addr.family() else {
        return;
    };
    let Ok(mapping) = daemon.cache.lookup_exact_mut(key.family, key.prefix, key.plen) else {
        return;
    };
    let list = match loc_family {
        Family::V4 => &mut mapping.locators_v4,
        Family::V6 => &mut mapping.locators_v6,
    };
    let Some(loc) = list.iter_mut().find(|l| &l.address == addr) else {
        return;
    };
    loc.state.set_up();
    if let Some(ext) = loc.remote_ext_mut() {
        ext.probe_retransmits = 0;
        ext.probe_timer = None;
        ext.last_reply = Some(std::time::Instant::now());
    }
    mapping.recompute_balance();
    let addr_str = addr.string_form();
    crate::probe::arm_steady(daemon, *key, addr_str);
}

/// Inbound Map-Request. An SMR-flagged request is a cue to refresh our
/// own (possibly stale) cache entry for the sender's EID, not a question
/// to answer -- no Map-Reply is sent back to it. A non-SMR request is
/// answered directly from `local_db` when we hold the matching prefix.
pub fn on_map_request(daemon: &mut Daemon, req: MapRequest, from: SocketAddr) {
    if req.flags.smr {
        for rec in &req.records {
            trigger_smr_refresh(daemon, rec.eid.clone());
        }
        return;
    }

    for rec in &req.records {
        let Some(family) = rec.eid.family() else {
            continue;
        };
        let Ok(mapping) = daemon.local_db.lookup_best(family, rec.eid.ip()) else {
            log::debug!("map-request for {}/{} has no local answer", rec.eid.string_form(), rec.mask_len);
            continue;
        };
        let record = local_mapping_record(mapping, req.flags.probe);
        let reply = MapReply {
            flags: ReplyFlags {
                probe: req.flags.probe,
                ..Default::default()
            },
            nonce: req.nonce,
            records: vec![record],
        };
        send_reply(daemon, &reply, &req, from);
    }
}

fn trigger_smr_refresh(daemon: &mut Daemon, eid: Address) {
    if daemon.pending.find_by_eid(&eid).is_some() {
        return;
    }
    send_new_request(daemon, eid, RequestKind::Smr);
}

fn local_mapping_record(mapping: &Mapping, probed: bool) -> MappingRecord {
    let mut locators = Vec::new();
    for loc in mapping.locators_v4.iter().chain(mapping.locators_v6.iter()) {
        locators.push(LocatorRecord {
            priority: loc.priority,
            weight: loc.weight,
            mpriority: loc.mpriority,
            mweight: loc.mweight,
            local: true,
            probed,
            reachable: loc.is_up(),
            address: loc.address.clone(),
        });
    }
    MappingRecord {
        ttl: mapping.ttl_seconds,
        mask_len: mapping.plen,
        action: mapping.action,
        authoritative: true,
        version: 0,
        eid: mapping.eid.clone(),
        locators,
    }
}

fn send_reply(daemon: &Daemon, reply: &MapReply, req: &MapRequest, from: SocketAddr) {
    let dst_ip = req.itr_rlocs.first().map(Address::ip).unwrap_or_else(|| from.ip());
    let dst = SocketAddr::new(dst_ip, LISP_CONTROL_PORT);
    let mut buf = vec![0u8; reply.size_on_wire()];
    {
        let mut w = CursorMut::new(&mut buf);
        if let Err(e) = reply.write_to(&mut w) {
            log::warn!("failed to encode map-reply to {dst}: {e}");
            return;
        }
    }
    if let Err(e) = daemon.send_to(dst, &buf) {
        log::warn!("failed to send map-reply to {dst}: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::daemon::Daemon;
    use crate::protocol::record::LocatorRecord;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_daemon_with_resolver() -> Daemon {
        let mut config = Config::default();
        config.map_resolvers.push(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 9)));
        Daemon::new_for_test(config).expect("ephemeral bind should succeed in a test sandbox")
    }

    #[test]
    fn cache_miss_sends_a_request_and_arms_a_retry() {
        let mut daemon = test_daemon_with_resolver();
        let eid = Address::IpPrefix(IpAddr::V4(Ipv4Addr::new(2, 0, 0, 1)), 32);

        resolve(&mut daemon, eid.clone());

        assert_eq!(daemon.pending.len(), 1);
        let nonce = daemon.pending.find_by_eid(&eid).expect("pending entry for the resolved eid");
        assert!(daemon.pending.get_mut(nonce).is_some());
    }

    #[test]
    fn cache_hit_never_issues_a_request() {
        let mut daemon = test_daemon_with_resolver();
        let eid = Address::IpPrefix(IpAddr::V4(Ipv4Addr::new(2, 0, 0, 0)), 24);
        let mapping = Mapping::new_cache(eid.clone(), 24, 0, 60);
        daemon.cache.install_or_refresh(Family::V4, eid.ip(), 24, mapping).unwrap();

        resolve(&mut daemon, Address::Ip(IpAddr::V4(Ipv4Addr::new(2, 0, 0, 5))));

        assert!(daemon.pending.is_empty());
    }

    #[test]
    fn retry_ladder_installs_a_negative_entry_once_exhausted() {
        let mut daemon = test_daemon_with_resolver();
        let eid = Address::IpPrefix(IpAddr::V4(Ipv4Addr::new(2, 0, 0, 1)), 32);
        resolve(&mut daemon, eid.clone());
        let nonce = daemon.pending.find_by_eid(&eid).unwrap();

        for _ in 0..=LISPD_MAX_MR_RETRANSMIT {
            on_retry(&mut daemon, nonce);
        }

        assert!(daemon.pending.is_empty());
        assert!(daemon.cache.lookup_best(Family::V4, eid.ip()).is_ok());
    }

    #[test]
    fn positive_reply_installs_a_one_slot_balancing_vector_and_cancels_the_retry() {
        let mut daemon = test_daemon_with_resolver();
        let eid = Address::IpPrefix(IpAddr::V4(Ipv4Addr::new(2, 0, 0, 1)), 32);
        resolve(&mut daemon, eid.clone());
        let nonce = daemon.pending.find_by_eid(&eid).unwrap();

        let reply = MapReply {
            flags: ReplyFlags::default(),
            nonce,
            records: vec![MappingRecord {
                ttl: 60,
                mask_len: 32,
                action: crate::mapping::Action::NoAction,
                authoritative: true,
                version: 0,
                eid: eid.clone(),
                locators: vec![LocatorRecord {
                    priority: 1,
                    weight: 50,
                    mpriority: 1,
                    mweight: 50,
                    local: false,
                    probed: false,
                    reachable: true,
                    address: Address::Ip(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1))),
                }],
            }],
        };
        on_map_reply(&mut daemon, reply);

        assert!(daemon.pending.is_empty());
        let mapping = daemon.cache.lookup_best(Family::V4, eid.ip()).unwrap();
        assert_eq!(mapping.balance.combined.len(), 1);

        resolve(&mut daemon, Address::Ip(IpAddr::V4(Ipv4Addr::new(2, 0, 0, 1))));
        assert!(daemon.pending.is_empty(), "a cache hit after install must not issue a new request");
    }

    #[test]
    fn negative_reply_is_cached_and_suppresses_further_requests() {
        let mut daemon = test_daemon_with_resolver();
        let eid = Address::IpPrefix(IpAddr::V4(Ipv4Addr::new(2, 0, 0, 0)), 24);
        resolve(&mut daemon, eid.clone());
        let nonce = daemon.pending.find_by_eid(&eid).unwrap();

        let reply = MapReply {
            flags: ReplyFlags::default(),
            nonce,
            records: vec![MappingRecord {
                ttl: 60,
                mask_len: 24,
                action: crate::mapping::Action::Drop,
                authoritative: true,
                version: 0,
                eid: eid.clone(),
                locators: vec![],
            }],
        };
        on_map_reply(&mut daemon, reply);

        let mapping = daemon.cache.lookup_best(Family::V4, eid.ip()).unwrap();
        assert_eq!(mapping.action, crate::mapping::Action::Drop);

        resolve(&mut daemon, Address::Ip(IpAddr::V4(Ipv4Addr::new(2, 0, 0, 5))));
        assert!(daemon.pending.is_empty(), "a negative cache entry must suppress a fresh request");
    }

    #[test]
    fn inbound_request_for_an_owned_prefix_is_answered_without_touching_pending() {
        let mut daemon = test_daemon_with_resolver();
        let eid = Address::IpPrefix(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0)), 24);
        let mut local = Mapping::new_local(eid.clone(), 24, 0);
        local
            .add_locator(crate::locator::Locator::new_local(
                Address::Ip(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))),
                1,
                50,
                "eth0",
            ))
            .unwrap();
        daemon.local_db.insert(Family::V4, eid.ip(), 24, local).unwrap();

        let req = MapRequest {
            flags: RequestFlags::default(),
            nonce: 42,
            source_eid: Address::NoAddr,
            itr_rlocs: vec![],
            records: vec![EidRecord {
                mask_len: 32,
                eid: Address::Ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))),
            }],
        };
        on_map_request(&mut daemon, req, SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)), LISP_CONTROL_PORT));

        assert!(daemon.pending.is_empty());
    }

    #[test]
    fn smr_flagged_request_triggers_a_refresh_instead_of_a_reply() {
        let mut daemon = test_daemon_with_resolver();
        let eid = Address::IpPrefix(IpAddr::V4(Ipv4Addr::new(2, 0, 0, 0)), 24);

        let req = MapRequest {
            flags: RequestFlags {
                smr: true,
                ..Default::default()
            },
            nonce: 7,
            source_eid: Address::NoAddr,
            itr_rlocs: vec![],
            records: vec![EidRecord { mask_len: 24, eid: eid.clone() }],
        };
        on_map_request(&mut daemon, req, SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)), LISP_CONTROL_PORT));

        let nonce = daemon.pending.find_by_eid(&eid).expect("an SMR-triggered refresh registers a pending request");
        let pending = daemon.pending.get_mut(nonce).unwrap();
        assert!(matches!(pending.kind, RequestKind::Smr));
    }
}
