// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::too_many_lines)]
#![allow(clippy::similar_names)]

//! Black-box scenarios driving a real [`Daemon`] through the wire protocol
//! end to end, in contrast to the unit tests living alongside each engine
//! module. A few of these still hit the fixed `LISP_CONTROL_PORT`/
//! `LISP_DATA_PORT` the engines hardcode as their destination, so any test
//! that binds one of those literal ports takes `FIXED_PORT` first; UDP has
//! no `TIME_WAIT`, so serializing bind/close/rebind across test functions
//! is enough without `SO_REUSEADDR`.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Mutex;
use std::time::Duration;

use lispd::address::{Address, Family};
use lispd::config::{Config, MapServerConfig, RouterMode};
use lispd::constants::{key_id, LISP_CONTROL_PORT, LISP_DATA_PORT};
use lispd::cursor::Cursor;
use lispd::daemon::{Daemon, MappingKey};
use lispd::locator::{Locator, NatStatus};
use lispd::mapping::{Action, Mapping};
use lispd::protocol::ecm::Ecm;
use lispd::protocol::map_register::{RegisterKind, RegisterMessage};
use lispd::protocol::map_reply::{MapReply, ReplyFlags};
use lispd::protocol::map_request::MapRequest;
use lispd::protocol::record::LocatorRecord;
use lispd::{probe, resolver};

static FIXED_PORT: Mutex<()> = Mutex::new(());

fn recv_with_timeout(sock: &UdpSocket, timeout: Duration) -> Option<(Vec<u8>, SocketAddr)> {
    sock.set_read_timeout(Some(timeout)).unwrap();
    let mut buf = [0u8; 4096];
    match sock.recv_from(&mut buf) {
        Ok((n, from)) => Some((buf[..n].to_vec(), from)),
        Err(_) => None,
    }
}

fn local_mapping(eid: IpAddr, plen: u8, locator_addr: IpAddr) -> Mapping {
    let mut mapping = Mapping::new_local(Address::IpPrefix(eid, plen), plen, 0);
    mapping
        .add_locator(Locator::new_local(Address::Ip(locator_addr), 1, 50, "eth0"))
        .unwrap();
    mapping
}

/// Plain registration: an xTR with one owned prefix and one map server
/// registers at startup with nonce 0 and an HMAC-SHA1-96 auth-data field
/// that verifies against the shared key.
#[test]
fn plain_registration_is_authenticated_and_carries_nonce_zero() {
    let _guard = FIXED_PORT.lock().unwrap();

    let server_sock = UdpSocket::bind((Ipv4Addr::LOCALHOST, LISP_CONTROL_PORT)).unwrap();
    let key = b"registration-shared-secret".to_vec();

    let mut config = Config::default();
    config.router_mode = RouterMode::Xtr;
    config
        .local_mappings
        .push(local_mapping(IpAddr::V4(Ipv4Addr::new(10, 1, 0, 0)), 24, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))));
    config.map_servers.push(MapServerConfig {
        addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        key_id: key_id::HMAC_SHA1_96,
        key: key.clone(),
        proxy_reply: false,
    });

    // Construction alone arms the startup registration at delay zero; the
    // first pump fires it.
    let mut daemon = Daemon::new_for_test(config).unwrap();
    daemon.pump_timers();

    let (buf, _) = recv_with_timeout(&server_sock, Duration::from_secs(2)).expect("no map-register arrived");
    let mut cursor = Cursor::new(&buf);
    let msg = RegisterMessage::read_from(&mut cursor, RegisterKind::Register).unwrap();
    assert_eq!(msg.nonce, 0);
    assert_eq!(msg.key_id, key_id::HMAC_SHA1_96);
    msg.verify(&key, &buf).expect("registration should verify against the configured key");
    assert_eq!(msg.records.len(), 1);
    assert_eq!(msg.records[0].mask_len, 24);
}

/// Retransmit ladder: the first `LISPD_MAX_RETRANSMITS` ticks keep the
/// daemon on the initial retry cadence; once that ladder is exhausted
/// without a Map-Notify, the cadence falls back to the steady-state
/// registration interval and stays there.
#[test]
fn retransmit_ladder_falls_back_to_steady_state_after_five_ticks() {
    let eid = IpAddr::V4(Ipv4Addr::new(10, 2, 0, 0));
    let mut config = Config::default();
    config.router_mode = RouterMode::Xtr;
    config.local_mappings.push(local_mapping(eid, 24, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 2))));
    config.map_servers.push(MapServerConfig {
        addr: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 9)),
        key_id: key_id::NONE,
        key: Vec::new(),
        proxy_reply: false,
    });

    let mut daemon = Daemon::new_for_test(config).unwrap();
    let key = MappingKey::of(&Address::IpPrefix(eid, 24), 24).unwrap();

    for tick in 1..=5 {
        lispd::register::on_register_tick(&mut daemon, key);
        let deadline = daemon.timers.next_deadline().unwrap();
        assert!(
            deadline <= Duration::from_secs(3),
            "tick {tick} should still be on the initial 3s cadence, got {deadline:?}"
        );
    }

    lispd::register::on_register_tick(&mut daemon, key);
    let deadline = daemon.timers.next_deadline().unwrap();
    assert!(
        deadline > Duration::from_secs(30),
        "after exhausting the ladder the cadence should fall back to the 60s steady state, got {deadline:?}"
    );
}

/// NAT-aware registration: once a locator's NAT status and learned RTR
/// are known, registration goes out ECM-encapsulated to the RTR's data
/// port rather than directly to the map server, carrying `xtr_id`/
/// `site_id` and the RTR flag.
#[test]
fn nat_aware_registration_encapsulates_through_the_rtr() {
    let _guard = FIXED_PORT.lock().unwrap();

    let rtr_addr = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let rtr_sock = UdpSocket::bind((Ipv4Addr::LOCALHOST, LISP_DATA_PORT)).unwrap();

    let eid = IpAddr::V4(Ipv4Addr::new(10, 3, 0, 0));
    let mut mapping = local_mapping(eid, 24, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 5)));
    {
        let loc = &mut mapping.locators_v4[0];
        let ext = loc.local_ext_mut().unwrap();
        ext.nat_status = NatStatus::Nat;
        ext.rtr_locators.push(Address::Ip(rtr_addr));
    }

    let mut config = Config::default();
    config.router_mode = RouterMode::Xtr;
    config.nat_aware = true;
    config.rtrs.push(rtr_addr);
    config.xtr_id = [0x11; 16];
    config.site_id = [0x22; 8];
    config.local_mappings.push(mapping);
    config.map_servers.push(MapServerConfig {
        addr: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 5)),
        key_id: key_id::HMAC_SHA1_96,
        key: b"nat-shared-secret".to_vec(),
        proxy_reply: true,
    });

    let mut daemon = Daemon::new_for_test(config).unwrap();
    daemon.pump_timers();

    let (buf, _) = recv_with_timeout(&rtr_sock, Duration::from_secs(2)).expect("no encapsulated register arrived");
    assert_eq!(buf[0] >> 4, lispd::constants::msg_type::ENCAP_CONTROL);
    let ecm = Ecm::read_from(&mut Cursor::new(&buf)).unwrap();
    assert_eq!(ecm.inner_dst.ip(), IpAddr::V4(Ipv4Addr::new(192, 0, 2, 5)));

    let mut inner_cursor = Cursor::new(ecm.inner_message);
    let msg = RegisterMessage::read_from(&mut inner_cursor, RegisterKind::Register).unwrap();
    assert!(msg.flags.rtr);
    assert!(msg.flags.xtr_id_present);
    assert_eq!(msg.xtr_id, Some([0x11; 16]));
    assert_eq!(msg.site_id, Some([0x22; 8]));
}

/// Map-Request / Map-Reply round trip: a cache miss for an IPv6 EID sends
/// a request to the configured resolver; a one-locator positive reply
/// installs a one-slot balancing vector and leaves the pending-request
/// table empty, so a repeat lookup never re-requests.
#[test]
fn map_request_reply_round_trip_installs_a_balancing_vector() {
    let _guard = FIXED_PORT.lock().unwrap();

    let resolver_sock = UdpSocket::bind((Ipv4Addr::LOCALHOST, LISP_CONTROL_PORT)).unwrap();

    let mut config = Config::default();
    config.map_resolvers.push(IpAddr::V4(Ipv4Addr::LOCALHOST));
    let mut daemon = Daemon::new_for_test(config).unwrap();

    let eid = Address::IpPrefix(IpAddr::V6(std::net::Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)), 128);
    resolver::resolve(&mut daemon, eid.clone());

    let (req_buf, from) = recv_with_timeout(&resolver_sock, Duration::from_secs(2)).expect("no map-request arrived");
    let req = MapRequest::read_from(&mut Cursor::new(&req_buf)).unwrap();
    assert_eq!(req.records.len(), 1);
    assert_eq!(req.records[0].eid.ip(), eid.ip());

    let locator_addr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9));
    let reply = MapReply {
        flags: ReplyFlags::default(),
        nonce: req.nonce,
        records: vec![lispd::protocol::record::MappingRecord {
            ttl: 1440,
            mask_len: 128,
            action: Action::NoAction,
            authoritative: true,
            version: 0,
            eid: eid.clone(),
            locators: vec![LocatorRecord {
                priority: 1,
                weight: 100,
                mpriority: 1,
                mweight: 100,
                local: false,
                probed: false,
                reachable: true,
                address: Address::Ip(locator_addr),
            }],
        }],
    };
    let mut buf = vec![0u8; reply.size_on_wire()];
    reply.write_to(&mut lispd::cursor::CursorMut::new(&mut buf)).unwrap();
    daemon.receive_datagram(&buf, from);

    let cached = daemon.cache.lookup_best(Family::V6, eid.ip()).expect("positive reply should be cached");
    assert_eq!(cached.balance.combined.len(), 1);
    assert!(daemon.pending.find_by_eid(&eid).is_none());

    // A repeat lookup is now a cache hit: no second request goes out.
    resolver::resolve(&mut daemon, eid);
    assert!(recv_with_timeout(&resolver_sock, Duration::from_millis(200)).is_none());
}

/// Negative reply: a `Drop` action with no locators installs a negative
/// cache entry, and resolution for that EID is suppressed for as long as
/// the entry lives rather than re-requesting.
#[test]
fn negative_reply_suppresses_further_requests() {
    let _guard = FIXED_PORT.lock().unwrap();

    let resolver_sock = UdpSocket::bind((Ipv4Addr::LOCALHOST, LISP_CONTROL_PORT)).unwrap();

    let mut config = Config::default();
    config.map_resolvers.push(IpAddr::V4(Ipv4Addr::LOCALHOST));
    let mut daemon = Daemon::new_for_test(config).unwrap();

    let eid = Address::IpPrefix(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 0)), 24);
    resolver::resolve(&mut daemon, eid.clone());
    let (req_buf, from) = recv_with_timeout(&resolver_sock, Duration::from_secs(2)).expect("no map-request arrived");
    let req = MapRequest::read_from(&mut Cursor::new(&req_buf)).unwrap();

    let reply = MapReply {
        flags: ReplyFlags::default(),
        nonce: req.nonce,
        records: vec![lispd::protocol::record::MappingRecord {
            ttl: 60,
            mask_len: 24,
            action: Action::Drop,
            authoritative: true,
            version: 0,
            eid: eid.clone(),
            locators: vec![],
        }],
    };
    let mut buf = vec![0u8; reply.size_on_wire()];
    reply.write_to(&mut lispd::cursor::CursorMut::new(&mut buf)).unwrap();
    daemon.receive_datagram(&buf, from);

    let cached = daemon.cache.lookup_best(Family::V4, eid.ip()).expect("negative reply should be cached");
    assert_eq!(cached.action, Action::Drop);

    resolver::resolve(&mut daemon, eid);
    assert!(
        recv_with_timeout(&resolver_sock, Duration::from_millis(200)).is_none(),
        "a cached negative entry must suppress further map-requests"
    );
}

/// Interface flap: an interface event rebalances local mappings and, once
/// the debounce settles, emits an SMR to every recently-seen peer for
/// every locally-registered EID.
#[test]
fn interface_flap_rebalances_and_emits_smr_to_recent_peers() {
    let peer_sock = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let peer_addr = peer_sock.local_addr().unwrap();

    let eid = IpAddr::V4(Ipv4Addr::new(10, 4, 0, 0));
    let mut config = Config::default();
    config.router_mode = RouterMode::Xtr;
    config.local_mappings.push(local_mapping(eid, 24, IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7))));
    config.map_servers.push(MapServerConfig {
        addr: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 5)),
        key_id: key_id::NONE,
        key: Vec::new(),
        proxy_reply: false,
    });
    let mut daemon = Daemon::new_for_test(config).unwrap();

    // Seed recent_peers the way an inbound datagram would, without caring
    // about its payload.
    daemon.receive_datagram(&[], peer_addr);

    probe::on_interface_event(&mut daemon);
    assert!(daemon.timers.next_deadline().is_some());

    // Fast-forward past the SMR debounce rather than sleeping 6 real
    // seconds for it.
    probe::on_smr_debounce(&mut daemon);

    let (buf, _) = recv_with_timeout(&peer_sock, Duration::from_secs(2)).expect("no smr map-request arrived");
    let req = MapRequest::read_from(&mut Cursor::new(&buf)).unwrap();
    assert!(req.flags.smr);
    assert_eq!(req.records[0].eid.ip(), eid);
}
