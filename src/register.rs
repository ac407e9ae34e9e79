// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Map Register engine: periodic authenticated registration of every
//! local mapping, with a NAT-aware encapsulated variant that registers
//! through an RTR once a locator's NAT status is known.

use std::net::SocketAddr;
use std::time::Duration;

use crate::address::{Address, Lcaf};
use crate::config::MapServerConfig;
use crate::constants::{
    key_id, DEFAULT_MAP_REQUEST_RETRIES, LISPD_INF_REQ_HANDOVER_TIMEOUT, LISPD_INITIAL_MR_TIMEOUT,
    LISPD_MAX_RETRANSMITS, LISP_CONTROL_PORT, LISP_DATA_PORT, MAP_REGISTER_INTERVAL,
};
use crate::cursor::CursorMut;
use crate::daemon::{mapping_timer, Daemon, MappingKey, TimerEvent};
use crate::locator::NatStatus;
use crate::mapping::{Mapping, MappingLifecycle};
use crate::protocol::ecm::{Ecm, EcmFlags};
use crate::protocol::info::InfoMessage;
use crate::protocol::map_register::{RegisterFlags, RegisterKind, RegisterMessage};
use crate::protocol::record::{LocatorRecord, MappingRecord};

pub fn schedule_startup(daemon: &mut Daemon) {
    for key in local_mapping_keys(daemon) {
        arm_register(daemon, key, Duration::from_secs(0));
    }
}

pub(crate) fn local_mapping_keys(daemon: &Daemon) -> Vec<MappingKey> {
    let mut keys = Vec::new();
    for family in [crate::address::Family::V4, crate::address::Family::V6] {
        daemon.local_db.walk(family, &mut |m: &Mapping| {
            if let Some(key) = MappingKey::of(&m.eid, m.plen) {
                keys.push(key);
            }
        });
    }
    keys
}

fn arm_register(daemon: &mut Daemon, key: MappingKey, delay: Duration) {
    let handle = mapping_timer(&mut daemon.register_handles, &mut daemon.timers, &key);
    daemon.timers.start(handle, delay, TimerEvent::Register(key));
}

pub fn on_register_tick(daemon: &mut Daemon, key: MappingKey) {
    if daemon.local_db.lookup_exact(key.family, key.prefix, key.plen).is_err() {
        daemon.register_handles.remove(&key);
        return;
    }
    if daemon.config.nat_aware {
        nat_aware_tick(daemon, key);
    } else {
        plain_tick(daemon, key);
    }
}

fn plain_tick(daemon: &mut Daemon, key: MappingKey) {
    let record = {
        let Ok(mapping) = daemon.local_db.lookup_exact(key.family, key.prefix, key.plen) else {
            return;
        };
        mapping_record(mapping)
    };

    let servers = daemon.config.map_servers.clone();
    for server in &servers {
        send_register(daemon, server, &record, 0);
    }

    {
        let Ok(mapping) = daemon.local_db.lookup_exact_mut(key.family, key.prefix, key.plen) else {
            return;
        };
        if let MappingLifecycle::Local(reg) = &mut mapping.lifecycle {
            reg.nonce_track.push(0);
        }
    }

    advance_retransmit(daemon, key);
}

/// Schedule the next registration tick. Per the resolved retransmit
/// question (DESIGN.md), there is no exponential backoff: the cadence is
/// gated purely on the retransmit counter, independent of whether a
/// Map-Notify ever arrives. The first `LISPD_MAX_RETRANSMITS` ticks run at
/// `LISPD_INITIAL_MR_TIMEOUT`; every tick after that runs at
/// `MAP_REGISTER_INTERVAL` forever. A Map-Notify only updates bookkeeping
/// (`registered`, nonce track reset) -- it does not itself change cadence.
fn advance_retransmit(daemon: &mut Daemon, key: MappingKey) {
    let delay = {
        let Ok(mapping) = daemon.local_db.lookup_exact_mut(key.family, key.prefix, key.plen) else {
            return;
        };
        let MappingLifecycle::Local(reg) = &mut mapping.lifecycle else {
            return;
        };
        reg.retransmits = reg.retransmits.saturating_add(1);
        if reg.retransmits <= LISPD_MAX_RETRANSMITS {
            Duration::from_secs(LISPD_INITIAL_MR_TIMEOUT)
        } else {
            if !reg.registered {
                log::warn!(
                    "no map-notify for {:?} after {} retransmits, falling back to steady-state interval",
                    key, LISPD_MAX_RETRANSMITS
                );
            }
            reg.nonce_track.reset();
            Duration::from_secs(MAP_REGISTER_INTERVAL)
        }
    };
    arm_register(daemon, key, delay);
}

fn mapping_record(mapping: &Mapping) -> MappingRecord {
    let mut locators = Vec::new();
    for loc in mapping.locators_v4.iter().chain(mapping.locators_v6.iter()) {
        locators.push(LocatorRecord {
            priority: loc.priority,
            weight: loc.weight,
            mpriority: loc.mpriority,
            mweight: loc.mweight,
            local: true,
            probed: false,
            reachable: loc.is_up(),
            address: loc.address.clone(),
        });
    }
    MappingRecord {
        ttl: mapping.ttl_seconds,
        mask_len: mapping.plen,
        action: mapping.action,
        authoritative: mapping.authoritative,
        version: 0,
        eid: mapping.eid.clone(),
        locators,
    }
}

fn send_register(daemon: &Daemon, server: &MapServerConfig, record: &MappingRecord, nonce: u64) {
    let msg = RegisterMessage {
        kind: RegisterKind::Register,
        flags: RegisterFlags {
            proxy_reply: server.proxy_reply,
            xtr_id_present: false,
            rtr: false,
        },
        nonce,
        key_id: server.key_id,
        records: vec![record.clone()],
        xtr_id: None,
        site_id: None,
    };
    let buf = match msg.encode_signed(&server.key) {
        Ok(b) => b,
        Err(e) => {
            log::warn!("failed to encode map-register for {}: {e}", server.addr);
            return;
        }
    };
    let dst = SocketAddr::new(server.addr, LISP_CONTROL_PORT);
    if let Err(e) = daemon.send_to(dst, &buf) {
        log::warn!("failed to send map-register to {dst}: {e}");
    }
}

fn nat_aware_tick(daemon: &mut Daemon, key: MappingKey) {
    let up_locators = {
        let Ok(mapping) = daemon.local_db.lookup_exact(key.family, key.prefix, key.plen) else {
            return;
        };
        let mut up = Vec::new();
        for (i, loc) in mapping.locators_v4.iter().enumerate() {
            if loc.is_up() {
                if let Some(ext) = loc.local_ext() {
                    up.push((crate::address::Family::V4, i, ext.nat_status));
                }
            }
        }
        for (i, loc) in mapping.locators_v6.iter().enumerate() {
            if loc.is_up() {
                if let Some(ext) = loc.local_ext() {
                    up.push((crate::address::Family::V6, i, ext.nat_status));
                }
            }
        }
        up
    };

    if up_locators.is_empty() {
        arm_register(daemon, key, Duration::from_secs(LISPD_INITIAL_MR_TIMEOUT));
        return;
    }

    if up_locators.iter().any(|(_, _, status)| *status == NatStatus::Unknown) {
        for (family, index, status) in &up_locators {
            if *status == NatStatus::Unknown {
                ensure_info_request(daemon, key, *family, *index);
            }
        }
        arm_register(daemon, key, Duration::from_secs(LISPD_INITIAL_MR_TIMEOUT));
        return;
    }

    if let Some((family, index, _)) = up_locators.iter().find(|(_, _, s)| *s == NatStatus::Nat) {
        send_nat_register(daemon, key, *family, *index);
        advance_retransmit(daemon, key);
        return;
    }

    plain_tick(daemon, key);
}

fn ensure_info_request(daemon: &mut Daemon, key: MappingKey, family: crate::address::Family, index: usize) {
    let locator_addr = {
        let Ok(mapping) = daemon.local_db.lookup_exact(key.family, key.prefix, key.plen) else {
            return;
        };
        let list = match family {
            crate::address::Family::V4 => &mapping.locators_v4,
            crate::address::Family::V6 => &mapping.locators_v6,
        };
        match list.get(index) {
            Some(loc) => loc.address.string_form(),
            None => return,
        }
    };

    let handle_key = (key, locator_addr.clone());
    let already_armed = match daemon.info_handles.get(&handle_key) {
        Some(h) => daemon.timers.is_scheduled(*h),
        None => false,
    };
    if already_armed {
        return;
    }

    send_info_request(daemon, key, &locator_addr);
    arm_info_request(daemon, key, locator_addr, Duration::from_secs(LISPD_INF_REQ_HANDOVER_TIMEOUT));
}

fn arm_info_request(daemon: &mut Daemon, key: MappingKey, locator_addr: String, delay: Duration) {
    let handle_key = (key, locator_addr.clone());
    let handle = crate::daemon::locator_timer(&mut daemon.info_handles, &mut daemon.timers, &handle_key);
    daemon.timers.start(
        handle,
        delay,
        TimerEvent::InfoRequest {
            mapping: key,
            locator_addr,
        },
    );
}

fn send_info_request(daemon: &mut Daemon, key: MappingKey, locator_addr: &str) {
    let dst_ip = match daemon
        .config
        .rtrs
        .first()
        .copied()
        .or_else(|| daemon.config.map_resolvers.first().copied())
    {
        Some(ip) => ip,
        None => {
            log::warn!("cannot send info-request: no RTR or map resolver configured");
            return;
        }
    };

    let nonce = daemon.nonce_gen.next();
    {
        let Ok(mapping) = daemon.local_db.lookup_exact_mut(key.family, key.prefix, key.plen) else {
            return;
        };
        let list = match key.family {
            crate::address::Family::V4 => &mut mapping.locators_v4,
            crate::address::Family::V6 => &mut mapping.locators_v6,
        };
        let Some(loc) = list.iter_mut().find(|l| l.address.string_form() == locator_addr) else {
            return;
        };
        let Some(ext) = loc.local_ext_mut() else {
            return;
        };
        ext.info_request_nonces.push(nonce);
    }

    let msg = InfoMessage {
        is_reply: false,
        nonce,
        key_id: key_id::NONE,
        ttl: 0,
        mask_len: key.plen,
        eid: Address::IpPrefix(key.prefix, key.plen),
        nat_info: None,
    };
    let buf = match msg.encode_signed(b"") {
        Ok(b) => b,
        Err(e) => {
            log::warn!("failed to encode info-request: {e}");
            return;
        }
    };
    let dst = SocketAddr::new(dst_ip, LISP_CONTROL_PORT);
    if let Err(e) = daemon.send_to(dst, &buf) {
        log::warn!("failed to send info-request to {dst}: {e}");
    }
}

pub fn on_info_retry(daemon: &mut Daemon, key: MappingKey, locator_addr: String) {
    let retransmits = {
        let Ok(mapping) = daemon.local_db.lookup_exact_mut(key.family, key.prefix, key.plen) else {
            return;
        };
        let list = match key.family {
            crate::address::Family::V4 => &mut mapping.locators_v4,
            crate::address::Family::V6 => &mut mapping.locators_v6,
        };
        let Some(loc) = list.iter_mut().find(|l| l.address.string_form() == locator_addr) else {
            return;
        };
        let Some(ext) = loc.local_ext_mut() else {
            return;
        };
        ext.info_request_nonces.retransmits += 1;
        ext.info_request_nonces.retransmits
    };

    if retransmits > DEFAULT_MAP_REQUEST_RETRIES {
        set_locator_nat_status(daemon, key, &locator_addr, NatStatus::NoInfoReply);
        daemon.info_handles.remove(&(key, locator_addr));
        return;
    }

    send_info_request(daemon, key, &locator_addr);
    arm_info_request(daemon, key, locator_addr, Duration::from_secs(LISPD_INF_REQ_HANDOVER_TIMEOUT));
}

fn set_locator_nat_status(daemon: &mut Daemon, key: MappingKey, locator_addr: &str, status: NatStatus) {
    let Ok(mapping) = daemon.local_db.lookup_exact_mut(key.family, key.prefix, key.plen) else {
        return;
    };
    let list = match key.family {
        crate::address::Family::V4 => &mut mapping.locators_v4,
        crate::address::Family::V6 => &mut mapping.locators_v6,
    };
    if let Some(loc) = list.iter_mut().find(|l| l.address.string_form() == locator_addr) {
        if let Some(ext) = loc.local_ext_mut() {
            ext.nat_status = status;
        }
    }
}

fn send_nat_register(daemon: &mut Daemon, key: MappingKey, family: crate::address::Family, index: usize) {
    let Some(server) = daemon.config.map_servers.first().cloned() else {
        log::warn!("nat-aware register: no map server configured");
        return;
    };

    let (record, rtr, loc_addr) = {
        let Ok(mapping) = daemon.local_db.lookup_exact(key.family, key.prefix, key.plen) else {
            return;
        };
        let record = mapping_record(mapping);
        let list = match family {
            crate::address::Family::V4 => &mapping.locators_v4,
            crate::address::Family::V6 => &mapping.locators_v6,
        };
        let Some(loc) = list.get(index) else {
            return;
        };
        let Some(ext) = loc.local_ext() else {
            return;
        };
        let Some(rtr) = ext.rtr_locators.first().cloned() else {
            log::warn!("nat-aware register: locator NAT status is Nat but no RTR learned yet");
            return;
        };
        (record, rtr, loc.address.clone())
    };

    let nonce = daemon.nonce_gen.next();
    let msg = RegisterMessage {
        kind: RegisterKind::Register,
        flags: RegisterFlags {
            proxy_reply: true,
            xtr_id_present: true,
            rtr: true,
        },
        nonce,
        key_id: server.key_id,
        records: vec![record],
        xtr_id: Some(daemon.config.xtr_id),
        site_id: Some(daemon.config.site_id),
    };
    let inner = match msg.encode_signed(&server.key) {
        Ok(b) => b,
        Err(e) => {
            log::warn!("failed to encode nat-aware map-register: {e}");
            return;
        }
    };

    let ecm = Ecm {
        flags: EcmFlags { secure: false, ddt: false },
        inner_src: loc_addr,
        inner_src_port: LISP_CONTROL_PORT,
        inner_dst: Address::Ip(server.addr),
        inner_dst_port: LISP_CONTROL_PORT,
        inner_message: &inner,
    };
    let mut buf = vec![0u8; ecm.size_on_wire()];
    {
        let mut w = CursorMut::new(&mut buf);
        if let Err(e) = ecm.write_to(&mut w) {
            log::warn!("failed to encode encapsulated map-register: {e}");
            return;
        }
    }

    let dst = SocketAddr::new(rtr.ip(), LISP_DATA_PORT);
    if let Err(e) = daemon.send_to(dst, &buf) {
        log::warn!("failed to send nat-aware map-register to {dst}: {e}");
        return;
    }

    let Ok(mapping) = daemon.local_db.lookup_exact_mut(key.family, key.prefix, key.plen) else {
        return;
    };
    if let MappingLifecycle::Local(reg) = &mut mapping.lifecycle {
        reg.nonce_track.push(nonce);
    }
}

/// A Map-Notify carries back the mapping record it is confirming, so the
/// target mapping is identified from the record itself rather than a
/// separate lookup table.
pub fn on_map_notify(daemon: &mut Daemon, notify: RegisterMessage, raw: &[u8]) {
    for record in &notify.records {
        let Some(family) = record.eid.family() else {
            continue;
        };
        let key = MappingKey {
            family,
            prefix: record.eid.ip(),
            plen: record.mask_len,
        };

        if daemon.local_db.lookup_exact(key.family, key.prefix, key.plen).is_err() {
            log::debug!("dropping map-notify for unknown mapping {}/{}", key.prefix, key.plen);
            continue;
        }

        let verify_key = daemon
            .config
            .map_servers
            .iter()
            .find(|ms| ms.key_id == notify.key_id)
            .map(|ms| ms.key.clone());
        let Some(verify_key) = verify_key else {
            log::debug!("no configured map server matches key-id {} on map-notify", notify.key_id);
            continue;
        };
        if notify.verify(&verify_key, raw).is_err() {
            log::warn!("map-notify for {}/{} failed HMAC verification", key.prefix, key.plen);
            continue;
        }

        let matched = {
            let Ok(mapping) = daemon.local_db.lookup_exact_mut(key.family, key.prefix, key.plen) else {
                continue;
            };
            let MappingLifecycle::Local(reg) = &mut mapping.lifecycle else {
                continue;
            };
            if reg.nonce_track.matches(notify.nonce) {
                reg.nonce_track.reset();
                reg.registered = true;
                true
            } else {
                false
            }
        };

        if matched {
            log::info!("registration confirmed for {}/{}", key.prefix, key.plen);
        }
    }
}

/// Inbound Info-Request/Info-Reply. Only replies are meaningful here --
/// this daemon is never the Info-Request responder.
pub fn on_info_message(daemon: &mut Daemon, info: InfoMessage, raw: &[u8], from: SocketAddr) {
    if !info.is_reply {
        return;
    }

    let Some((key, locator_addr, loc_ip)) = find_locator_by_nonce(daemon, info.nonce) else {
        log::debug!("dropping unmatched info-reply from {from} (nonce {})", info.nonce);
        return;
    };

    let verify_key = daemon
        .config
        .map_servers
        .iter()
        .find(|ms| ms.addr == from.ip())
        .map(|ms| ms.key.clone())
        .unwrap_or_default();
    if info.verify(&verify_key, raw).is_err() {
        log::warn!("info-reply from {from} failed HMAC verification");
        return;
    }

    let (status, rtr_list, public_addr) = match &info.nat_info {
        Some(Address::Lcaf(Lcaf::NatTraversal(nat))) => {
            let status = if nat.global_etr.ip() == loc_ip {
                NatStatus::NoNat
            } else {
                NatStatus::Nat
            };
            (status, nat.rtr_list.clone(), Some((*nat.global_etr).clone()))
        }
        _ => (NatStatus::NoNat, Vec::new(), None),
    };

    set_locator_nat_status(daemon, key, &locator_addr, status);

    {
        let Ok(mapping) = daemon.local_db.lookup_exact_mut(key.family, key.prefix, key.plen) else {
            return;
        };
        let list = match key.family {
            crate::address::Family::V4 => &mut mapping.locators_v4,
            crate::address::Family::V6 => &mut mapping.locators_v6,
        };
        if let Some(loc) = list.iter_mut().find(|l| l.address.string_form() == locator_addr) {
            if let Some(ext) = loc.local_ext_mut() {
                ext.rtr_locators = rtr_list;
                ext.public_addr = public_addr;
                ext.info_request_nonces.reset();
            }
        }
    }
    daemon.info_handles.remove(&(key, locator_addr));
}

fn find_locator_by_nonce(daemon: &Daemon, nonce: u64) -> Option<(MappingKey, String, std::net::IpAddr)> {
    for family in [crate::address::Family::V4, crate::address::Family::V6] {
        let mut found = None;
        daemon.local_db.walk(family, &mut |m: &Mapping| {
            if found.is_some() {
                return;
            }
            let Some(key) = MappingKey::of(&m.eid, m.plen) else {
                return;
            };
            let list = match family {
                crate::address::Family::V4 => &m.locators_v4,
                crate::address::Family::V6 => &m.locators_v6,
            };
            for loc in list {
                if let Some(ext) = loc.local_ext() {
                    if ext.info_request_nonces.matches(nonce) {
                        found = Some((key, loc.address.string_form(), loc.address.ip()));
                        return;
                    }
                }
            }
        });
        if found.is_some() {
            return found;
        }
    }
    None
}
