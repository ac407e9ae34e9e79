// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The `Daemon` context and its single-threaded cooperative event loop.
//!
//! # Architecture
//!
//! ```text
//! +---------------------------------------------------------------+
//! |                           Daemon                                |
//! |  +-----------------------------------------------------------+ |
//! |  |                       mio::Poll                            | |
//! |  |  - UDP v4 control socket  (UDP4_TOKEN)                     | |
//! |  |  - UDP v6 control socket  (UDP6_TOKEN, optional)           | |
//! |  |  - netlink fd via SourceFd (NETLINK_TOKEN)                 | |
//! |  +-----------------------------------------------------------+ |
//! |                              |                                  |
//! |                              v                                  |
//! |  +--------------+   +---------------+   +---------------------+ |
//! |  |  register.rs |   |  resolver.rs  |   |      probe.rs       | |
//! |  | Map Register |   | Map Request / |   | RLOC probing & SMR  | |
//! |  |    engine     |   | Reply engine  |   |       engine        | |
//! |  +--------------+   +---------------+   +---------------------+ |
//! |                              |                                  |
//! |                              v                                  |
//! |           local_db (Db)            cache (Db)                   |
//! +---------------------------------------------------------------+
//! ```
//!
//! All three engines are driven from one place: readiness on a socket
//! dispatches into `dispatch_control_message`, and a fired timer dispatches
//! into `run_timers`. No engine ever blocks or spawns a thread.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use mio::net::UdpSocket;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

use crate::address::{Address, Family};
use crate::config::Config;
use crate::constants::{DEFAULT_SELECT_TIMEOUT_MS, LISP_CONTROL_PORT};
use crate::db::Db;
use crate::error::Result;
use crate::netlink::NetlinkSocket;
use crate::nonce::{NonceGenerator, PendingRequestTable};
use crate::timer::{TimerHandle, TimerWheel};
use crate::{probe, register, resolver};

const UDP4_TOKEN: Token = Token(0);
const UDP6_TOKEN: Token = Token(1);
const NETLINK_TOKEN: Token = Token(2);
const MAX_EVENTS: usize = 128;

/// Identifies one local-DB or map-cache entry for timer/handle bookkeeping
/// that can't borrow a reference into the trie across a suspension point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappingKey {
    pub family: Family,
    pub prefix: IpAddr,
    pub plen: u8,
}

impl MappingKey {
    pub fn of(eid: &Address, plen: u8) -> Option<MappingKey> {
        Some(MappingKey {
            family: eid.family()?,
            prefix: eid.ip(),
            plen,
        })
    }
}

/// Every distinct reason the timer wheel wakes the loop up.
#[derive(Debug, Clone)]
pub enum TimerEvent {
    Register(MappingKey),
    InfoRequest { mapping: MappingKey, locator_addr: String },
    ResolverRetry(u64),
    Probe { mapping: MappingKey, locator_addr: String },
    SmrDebounce,
    CacheExpire(MappingKey),
    SmrRetry { eid: Address, peer: SocketAddr, remaining: u8 },
}

/// The whole daemon: sockets, databases, pending-request and timer state.
/// Owned by a single thread; no field is ever shared outside it except the
/// `Arc<AtomicU8>` backing individual `LocatorState`s.
pub struct Daemon {
    pub config: Config,
    pub local_db: Db,
    pub cache: Db,
    pub pending: PendingRequestTable,
    pub nonce_gen: NonceGenerator,
    pub timers: TimerWheel<TimerEvent>,
    pub register_handles: HashMap<MappingKey, TimerHandle>,
    pub info_handles: HashMap<(MappingKey, String), TimerHandle>,
    pub probe_handles: HashMap<(MappingKey, String), TimerHandle>,
    pub expire_handles: HashMap<MappingKey, TimerHandle>,
    pub smr_retry_handles: HashMap<(MappingKey, SocketAddr), TimerHandle>,
    pub smr_handle: TimerHandle,
    pub next_resolver: usize,
    /// Peers we've recently exchanged control traffic with, used to decide
    /// who to SMR when our own mappings change. Bounded so a chatty
    /// resolver can't grow this without limit.
    pub recent_peers: Vec<SocketAddr>,

    poll: Poll,
    udp4: UdpSocket,
    udp6: Option<UdpSocket>,
    netlink: NetlinkSocket,
    running: bool,
}

const RECENT_PEERS_CAP: usize = 64;

impl Daemon {
    pub fn new(config: Config) -> Result<Daemon> {
        Self::bind(config, LISP_CONTROL_PORT)
    }

    /// Construct against OS-assigned ephemeral ports rather than the fixed
    /// control port, so unit/integration tests can run several daemons
    /// concurrently without fighting over `LISP_CONTROL_PORT`. Gated behind
    /// the `test-util` feature rather than plain `#[cfg(test)]` so that
    /// `tests/` integration suites, which compile against this crate as an
    /// external dependency, can reach it too.
    #[cfg(any(test, feature = "test-util"))]
    pub fn new_for_test(config: Config) -> Result<Daemon> {
        Self::bind(config, 0)
    }

    fn bind(config: Config, port: u16) -> Result<Daemon> {
        config.validate()?;

        let mut poll = Poll::new()?;

        let bind4: SocketAddr = (IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), port).into();
        let mut udp4 = UdpSocket::bind(bind4)?;
        poll.registry().register(&mut udp4, UDP4_TOKEN, Interest::READABLE)?;

        let bind6: SocketAddr = (IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), port).into();
        let udp6 = match UdpSocket::bind(bind6) {
            Ok(mut sock) => {
                poll.registry().register(&mut sock, UDP6_TOKEN, Interest::READABLE)?;
                Some(sock)
            }
            Err(e) => {
                log::warn!("failed to bind IPv6 control socket, continuing v4-only: {e}");
                None
            }
        };

        let netlink = NetlinkSocket::open()?;
        poll.registry()
            .register(&mut SourceFd(&netlink.as_raw_fd()), NETLINK_TOKEN, Interest::READABLE)?;

        let mut local_db = Db::new();
        for mapping in &config.local_mappings {
            local_db.insert(mapping.eid.family().unwrap(), mapping.eid.ip(), mapping.plen, mapping.clone())?;
        }

        let mut timers = TimerWheel::new();
        let smr_handle = timers.new_handle();

        let mut daemon = Daemon {
            config,
            local_db,
            cache: Db::new(),
            pending: PendingRequestTable::new(),
            nonce_gen: NonceGenerator::new(),
            timers,
            register_handles: HashMap::new(),
            info_handles: HashMap::new(),
            probe_handles: HashMap::new(),
            expire_handles: HashMap::new(),
            smr_retry_handles: HashMap::new(),
            smr_handle,
            next_resolver: 0,
            recent_peers: Vec::new(),
            poll,
            udp4,
            udp6,
            netlink,
            running: true,
        };

        register::schedule_startup(&mut daemon);
        probe::schedule_startup(&mut daemon);

        Ok(daemon)
    }

    /// Run until `running` is cleared (currently only by a fatal socket
    /// error bubbling out of a handler -- there is no remote shutdown
    /// request in this crate's scope).
    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(MAX_EVENTS);

        while self.running {
            let timeout = self
                .timers
                .next_deadline()
                .map(|d| d.min(Duration::from_millis(DEFAULT_SELECT_TIMEOUT_MS)))
                .unwrap_or(Duration::from_millis(DEFAULT_SELECT_TIMEOUT_MS));

            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    return Err(e.into());
                }
                continue;
            }

            // Priority order within a batch: netlink before control-in,
            // timers last (the `run_timers()` call below). A flapping
            // interface must be observed before any control message that
            // arrived in the same readiness batch is acted on.
            if events.iter().any(|e| e.token() == NETLINK_TOKEN) {
                self.handle_netlink();
            }
            for event in events.iter() {
                match event.token() {
                    UDP4_TOKEN => self.handle_udp_readable(Family::V4),
                    UDP6_TOKEN => self.handle_udp_readable(Family::V6),
                    _ => {}
                }
            }

            self.run_timers();
        }

        self.exit_cleanup();
        Ok(())
    }

    fn handle_netlink(&mut self) {
        match self.netlink.drain() {
            Ok(0) => {}
            Ok(n) => {
                log::debug!("netlink reported {n} interface event(s)");
                probe::on_interface_event(self);
            }
            Err(e) => log::warn!("netlink read failed: {e}"),
        }
    }

    fn handle_udp_readable(&mut self, family: Family) {
        let mut buf = [0u8; 4096];
        loop {
            let recv = match family {
                Family::V4 => self.udp4.recv_from(&mut buf),
                Family::V6 => match &self.udp6 {
                    Some(sock) => sock.recv_from(&mut buf),
                    None => return,
                },
            };
            let (n, from) = match recv {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    log::warn!("udp recv failed: {e}");
                    return;
                }
            };
            self.note_peer(from);
            self.dispatch_control_message(&buf[..n], from);
        }
    }

    fn dispatch_control_message(&mut self, buf: &[u8], from: SocketAddr) {
        use crate::protocol::{ControlMessage, decode_ecm};
        use crate::constants::msg_type;

        let ty = match buf.first() {
            Some(b) => b >> 4,
            None => return,
        };

        if ty == msg_type::ENCAP_CONTROL {
            match decode_ecm(buf) {
                Ok(ecm) => self.dispatch_control_message(ecm.inner_message, from),
                Err(e) => log::debug!("dropping malformed ECM from {from}: {e}"),
            }
            return;
        }

        match ControlMessage::decode(buf) {
            Ok(ControlMessage::Request(req)) => resolver::on_map_request(self, req, from),
            Ok(ControlMessage::Reply(rep)) => resolver::on_map_reply(self, rep),
            Ok(ControlMessage::Register(_)) => {
                log::debug!("ignoring inbound Map-Register from {from}: not a map server role");
            }
            Ok(ControlMessage::Notify(notify)) => register::on_map_notify(self, notify, buf),
            Ok(ControlMessage::Info(info)) => register::on_info_message(self, info, buf, from),
            Err(e) => log::debug!("dropping malformed control message from {from}: {e}"),
        }
    }

    fn note_peer(&mut self, peer: SocketAddr) {
        if self.recent_peers.contains(&peer) {
            return;
        }
        if self.recent_peers.len() >= RECENT_PEERS_CAP {
            self.recent_peers.remove(0);
        }
        self.recent_peers.push(peer);
    }

    fn run_timers(&mut self) {
        let fired = self.timers.poll();
        for f in fired {
            match f.argument {
                TimerEvent::Register(key) => register::on_register_tick(self, key),
                TimerEvent::InfoRequest { mapping, locator_addr } => {
                    register::on_info_retry(self, mapping, locator_addr)
                }
                TimerEvent::ResolverRetry(nonce) => resolver::on_retry(self, nonce),
                TimerEvent::Probe { mapping, locator_addr } => probe::on_probe_tick(self, mapping, locator_addr),
                TimerEvent::SmrDebounce => probe::on_smr_debounce(self),
                TimerEvent::CacheExpire(key) => {
                    self.cache.expire(key.family, key.prefix, key.plen);
                    self.expire_handles.remove(&key);
                }
                TimerEvent::SmrRetry { eid, peer, remaining } => probe::on_smr_retry(self, eid, peer, remaining),
            }
        }
    }

    /// Send a raw datagram, routing to the v4 or v6 control socket by the
    /// destination's own family. A `WouldBlock` send is treated as a
    /// deferral, not an error -- the caller's retransmission timer will
    /// simply try again.
    pub fn send_to(&self, dst: SocketAddr, buf: &[u8]) -> Result<()> {
        let result = match dst {
            SocketAddr::V4(_) => self.udp4.send_to(buf, dst),
            SocketAddr::V6(_) => match &self.udp6 {
                Some(sock) => sock.send_to(buf, dst),
                None => {
                    log::warn!("dropping send to {dst}: no IPv6 control socket bound");
                    return Ok(());
                }
            },
        };
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// The bound address of the v4 or v6 control socket, so a test driving
    /// this daemon as a black box can address traffic back to it without
    /// having to hardcode the (ephemeral, OS-assigned) port.
    #[cfg(any(test, feature = "test-util"))]
    pub fn local_control_addr(&self, family: Family) -> Result<SocketAddr> {
        match family {
            Family::V4 => Ok(self.udp4.local_addr()?),
            Family::V6 => match &self.udp6 {
                Some(sock) => Ok(sock.local_addr()?),
                None => Err(crate::error::LispError::ControlInterfaceMissing(
                    "no IPv6 control socket bound".into(),
                )),
            },
        }
    }

    /// Run every timer whose deadline has passed, exactly as the event
    /// loop's own tick does. Lets a scenario test advance the daemon's
    /// state machine without sleeping on wall-clock time.
    #[cfg(any(test, feature = "test-util"))]
    pub fn pump_timers(&mut self) {
        self.run_timers();
    }

    /// Feed a raw datagram into the daemon as if it had just arrived on a
    /// control socket from `from`.
    #[cfg(any(test, feature = "test-util"))]
    pub fn receive_datagram(&mut self, buf: &[u8], from: SocketAddr) {
        self.note_peer(from);
        self.dispatch_control_message(buf, from);
    }

    fn exit_cleanup(&mut self) {
        let mut handles: Vec<TimerHandle> = self.register_handles.values().copied().collect();
        handles.extend(self.info_handles.values().copied());
        handles.extend(self.probe_handles.values().copied());
        handles.extend(self.expire_handles.values().copied());
        handles.extend(self.smr_retry_handles.values().copied());
        handles.push(self.smr_handle);
        for h in handles {
            self.timers.cancel(h);
        }
        log::info!("daemon shutdown complete");
    }
}

/// Get-or-create a timer handle for `key` in `handles`, without a closure
/// that would capture the whole `Daemon` and double-borrow it alongside
/// the caller's own borrow of `timers`.
pub fn mapping_timer(
    handles: &mut HashMap<MappingKey, TimerHandle>,
    timers: &mut TimerWheel<TimerEvent>,
    key: &MappingKey,
) -> TimerHandle {
    if let Some(h) = handles.get(key) {
        return *h;
    }
    let h = timers.new_handle();
    handles.insert(*key, h);
    h
}

pub fn locator_timer(
    handles: &mut HashMap<(MappingKey, String), TimerHandle>,
    timers: &mut TimerWheel<TimerEvent>,
    key: &(MappingKey, String),
) -> TimerHandle {
    if let Some(h) = handles.get(key) {
        return *h;
    }
    let h = timers.new_handle();
    handles.insert(key.clone(), h);
    h
}

pub fn smr_retry_timer(
    handles: &mut HashMap<(MappingKey, SocketAddr), TimerHandle>,
    timers: &mut TimerWheel<TimerEvent>,
    key: &(MappingKey, SocketAddr),
) -> TimerHandle {
    if let Some(h) = handles.get(key) {
        return *h;
    }
    let h = timers.new_handle();
    handles.insert(*key, h);
    h
}
