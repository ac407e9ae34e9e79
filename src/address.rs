// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! LISP address model and wire codec.
//!
//! A LISP [`Address`] is a tagged union of a plain IP address, an IP
//! prefix (an IP address paired with a prefix length that is *not* part
//! of the on-wire address encoding -- callers carry it alongside, the way
//! Map-Request/Map-Reply EID records carry `mask_len` as a sibling field),
//! and the LCAF (LISP Canonical Address Format, RFC 8060) variants this
//! daemon needs: Instance-ID, Multicast-Info, NAT-Traversal,
//! Application-Data, and Explicit-Locator-Path.
//!
//! Wire layout for a plain address is a 16-bit AFI in network order
//! followed by the raw address bytes (4 for IPv4, 16 for IPv6). LCAF
//! addresses are the LCAF AFI (16387) followed by a fixed 6-byte header
//! (`rsvd1, flags, type, rsvd2, length`) and a type-specific body.

use crate::cursor::{Cursor, CursorMut};
use crate::error::LispError;
use std::cmp::Ordering;
use std::net::{Ipv4Addr, Ipv6Addr};

type Result<T> = std::result::Result<T, LispError>;

/// IANA Address Family Identifiers relevant to LISP.
pub mod afi {
    pub const NO_ADDR: u16 = 0;
    pub const IPV4: u16 = 1;
    pub const IPV6: u16 = 2;
    pub const LCAF: u16 = 16387;
}

/// LCAF type codes (RFC 8060 Section 4 and the LISP NAT-traversal draft).
pub mod lcaf_type {
    pub const INSTANCE_ID: u8 = 2;
    pub const APPLICATION_DATA: u8 = 4;
    pub const NAT_TRAVERSAL: u8 = 7;
    pub const MULTICAST_INFO: u8 = 9;
    pub const EXPLICIT_LOCATOR_PATH: u8 = 10;
}

/// Address family an [`Address`] belongs to, for routing it into the
/// correct per-family locator list or trie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

/// One hop of an Explicit Locator Path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatorPathHop {
    /// Bit 0 = L (local), bit 1 = P (probe), bit 2 = S (strict).
    pub flags: u8,
    pub address: Box<Address>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MulticastInfo {
    pub iid: u32,
    pub source_plen: u8,
    pub group_plen: u8,
    pub source: Box<Address>,
    pub group: Box<Address>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatTraversalInfo {
    pub ms_port: u16,
    pub etr_port: u16,
    pub global_etr: Box<Address>,
    pub ms: Box<Address>,
    pub priv_etr: Box<Address>,
    pub rtr_list: Vec<Address>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIdInfo {
    pub iid: u32,
    pub inner: Box<Address>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDataInfo {
    pub protocol: u8,
    pub local_port_low: u16,
    pub local_port_high: u16,
    pub remote_port_low: u16,
    pub remote_port_high: u16,
    pub inner: Box<Address>,
}

/// The LCAF variants this daemon understands and round-trips.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lcaf {
    MulticastInfo(MulticastInfo),
    NatTraversal(NatTraversalInfo),
    InstanceId(InstanceIdInfo),
    AppData(AppDataInfo),
    ExplicitLocatorPath(Vec<LocatorPathHop>),
}

/// A LISP address: no-address placeholder, plain IP (or IP prefix, plen
/// carried out-of-band), or an LCAF extended address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    NoAddr,
    Ip(std::net::IpAddr),
    IpPrefix(std::net::IpAddr, u8),
    Lcaf(Lcaf),
}

impl Address {
    /// Accessor for the plain IP carried by `Ip`/`IpPrefix`. Programming
    /// error (panics) to call on a mismatched tag -- per the address
    /// model invariant, callers are expected to match on `Family`/tag
    /// first.
    pub fn ip(&self) -> std::net::IpAddr {
        match self {
            Address::Ip(ip) | Address::IpPrefix(ip, _) => *ip,
            Address::Lcaf(Lcaf::MulticastInfo(m)) => m.group.ip(),
            other => panic!("Address::ip() called on {:?}", other.kind_name()),
        }
    }

    pub fn plen(&self) -> u8 {
        match self {
            Address::IpPrefix(_, plen) => *plen,
            Address::Ip(std::net::IpAddr::V4(_)) => 32,
            Address::Ip(std::net::IpAddr::V6(_)) => 128,
            other => panic!("Address::plen() called on {:?}", other.kind_name()),
        }
    }

    pub fn family(&self) -> Option<Family> {
        match self {
            Address::Ip(std::net::IpAddr::V4(_)) | Address::IpPrefix(std::net::IpAddr::V4(_), _) => {
                Some(Family::V4)
            }
            Address::Ip(std::net::IpAddr::V6(_)) | Address::IpPrefix(std::net::IpAddr::V6(_), _) => {
                Some(Family::V6)
            }
            Address::Lcaf(Lcaf::MulticastInfo(m)) => m.group.family(),
            _ => None,
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Address::NoAddr => "NoAddr",
            Address::Ip(_) => "Ip",
            Address::IpPrefix(..) => "IpPrefix",
            Address::Lcaf(_) => "Lcaf",
        }
    }

    /// Zero out the bits outside `plen` so two prefixes that differ only
    /// in host bits compare and hash equal.
    pub fn canonicalize(&self) -> Address {
        match self {
            Address::IpPrefix(std::net::IpAddr::V4(v4), plen) => {
                let masked = mask_v4(*v4, *plen);
                Address::IpPrefix(masked.into(), *plen)
            }
            Address::IpPrefix(std::net::IpAddr::V6(v6), plen) => {
                let masked = mask_v6(*v6, *plen);
                Address::IpPrefix(masked.into(), *plen)
            }
            other => other.clone(),
        }
    }

    pub fn string_form(&self) -> String {
        match self {
            Address::NoAddr => "0.0.0.0".to_string(),
            Address::Ip(ip) => ip.to_string(),
            Address::IpPrefix(ip, plen) => format!("{}/{}", ip, plen),
            Address::Lcaf(Lcaf::MulticastInfo(m)) => {
                format!(
                    "({}/{}, {}/{})[iid {}]",
                    m.source.string_form(),
                    m.source_plen,
                    m.group.string_form(),
                    m.group_plen,
                    m.iid
                )
            }
            Address::Lcaf(Lcaf::NatTraversal(n)) => {
                format!(
                    "nat-traversal(global={}, ms={}, rtrs={})",
                    n.global_etr.string_form(),
                    n.ms.string_form(),
                    n.rtr_list.len()
                )
            }
            Address::Lcaf(Lcaf::InstanceId(i)) => {
                format!("[{}]{}", i.iid, i.inner.string_form())
            }
            Address::Lcaf(Lcaf::AppData(a)) => {
                format!("appdata(proto={}){}", a.protocol, a.inner.string_form())
            }
            Address::Lcaf(Lcaf::ExplicitLocatorPath(hops)) => {
                let hops: Vec<String> = hops.iter().map(|h| h.address.string_form()).collect();
                format!("elp[{}]", hops.join(" -> "))
            }
        }
    }

    fn tag_order(&self) -> u8 {
        match self {
            Address::NoAddr => 0,
            Address::Ip(_) => 1,
            Address::IpPrefix(..) => 2,
            Address::Lcaf(_) => 3,
        }
    }

    /// Total order: tag, then lexicographic on canonicalized bytes, then
    /// prefix length.
    pub fn compare(a: &Address, b: &Address) -> Ordering {
        match a.tag_order().cmp(&b.tag_order()) {
            Ordering::Equal => {}
            other => return other,
        }
        match (a, b) {
            (Address::NoAddr, Address::NoAddr) => Ordering::Equal,
            (Address::Ip(x), Address::Ip(y)) => compare_ip(x, y),
            (Address::IpPrefix(_, px), Address::IpPrefix(_, py)) => {
                let ca = a.canonicalize();
                let cb = b.canonicalize();
                let (xc, yc) = match (&ca, &cb) {
                    (Address::IpPrefix(xc, _), Address::IpPrefix(yc, _)) => (*xc, *yc),
                    _ => unreachable!(),
                };
                match compare_ip(&xc, &yc) {
                    Ordering::Equal => px.cmp(py),
                    other => other,
                }
            }
            (Address::Lcaf(_), Address::Lcaf(_)) => {
                // Stable but arbitrary order across LCAF bodies: compare
                // encoded bytes.
                let mut ba = Vec::new();
                let mut bb = Vec::new();
                let _ = a.write_to_vec(&mut ba);
                let _ = b.write_to_vec(&mut bb);
                ba.cmp(&bb)
            }
            _ => Ordering::Equal,
        }
    }

    pub fn size_on_wire(&self) -> usize {
        match self {
            Address::NoAddr => 2,
            Address::Ip(std::net::IpAddr::V4(_)) | Address::IpPrefix(std::net::IpAddr::V4(_), _) => 2 + 4,
            Address::Ip(std::net::IpAddr::V6(_)) | Address::IpPrefix(std::net::IpAddr::V6(_), _) => 2 + 16,
            Address::Lcaf(lcaf) => 2 + 6 + lcaf_body_len(lcaf),
        }
    }

    pub fn write_to(&self, cursor: &mut CursorMut) -> Result<()> {
        match self {
            Address::NoAddr => cursor.write_u16(afi::NO_ADDR),
            Address::Ip(std::net::IpAddr::V4(v4)) | Address::IpPrefix(std::net::IpAddr::V4(v4), _) => {
                cursor.write_u16(afi::IPV4)?;
                cursor.write_bytes(&v4.octets())
            }
            Address::Ip(std::net::IpAddr::V6(v6)) | Address::IpPrefix(std::net::IpAddr::V6(v6), _) => {
                cursor.write_u16(afi::IPV6)?;
                cursor.write_bytes(&v6.octets())
            }
            Address::Lcaf(lcaf) => {
                cursor.write_u16(afi::LCAF)?;
                cursor.write_u8(0)?; // rsvd1
                cursor.write_u8(0)?; // flags
                cursor.write_u8(lcaf_type_of(lcaf))?;
                cursor.write_u8(0)?; // rsvd2
                let body_len = lcaf_body_len(lcaf);
                cursor.write_u16(body_len as u16)?;
                write_lcaf_body(lcaf, cursor)
            }
        }
    }

    fn write_to_vec(&self, out: &mut Vec<u8>) -> Result<()> {
        let mut buf = vec![0u8; self.size_on_wire()];
        {
            let mut cursor = CursorMut::new(&mut buf);
            self.write_to(&mut cursor)?;
        }
        out.extend_from_slice(&buf);
        Ok(())
    }

    /// Decode an address (plain or LCAF) from `cursor`. Returns the
    /// decoded address; the cursor is advanced past it.
    pub fn read_from(cursor: &mut Cursor) -> Result<Address> {
        let afi_val = cursor.read_u16()?;
        match afi_val {
            afi::NO_ADDR => Ok(Address::NoAddr),
            afi::IPV4 => {
                let bytes = cursor.read_bytes(4)?;
                let arr: [u8; 4] = bytes.try_into().unwrap();
                Ok(Address::Ip(Ipv4Addr::from(arr).into()))
            }
            afi::IPV6 => {
                let bytes = cursor.read_bytes(16)?;
                let arr: [u8; 16] = bytes.try_into().unwrap();
                Ok(Address::Ip(Ipv6Addr::from(arr).into()))
            }
            afi::LCAF => {
                let _rsvd1 = cursor.read_u8()?;
                let _flags = cursor.read_u8()?;
                let lcaf_ty = cursor.read_u8()?;
                let _rsvd2 = cursor.read_u8()?;
                let len = cursor.read_u16()? as usize;
                let body = cursor.read_bytes(len)?;
                let mut body_cursor = Cursor::new(body);
                let lcaf = read_lcaf_body(lcaf_ty, &mut body_cursor)?;
                Ok(Address::Lcaf(lcaf))
            }
            other => Err(LispError::BadAfi(other)),
        }
    }
}

fn compare_ip(a: &std::net::IpAddr, b: &std::net::IpAddr) -> Ordering {
    use std::net::IpAddr::*;
    match (a, b) {
        (V4(x), V4(y)) => x.octets().cmp(&y.octets()),
        (V6(x), V6(y)) => x.octets().cmp(&y.octets()),
        (V4(_), V6(_)) => Ordering::Less,
        (V6(_), V4(_)) => Ordering::Greater,
    }
}

pub fn mask_v4(addr: Ipv4Addr, plen: u8) -> Ipv4Addr {
    let bits = u32::from(addr);
    let mask = if plen >= 32 { u32::MAX } else { !0u32 << (32 - plen) };
    Ipv4Addr::from(bits & mask)
}

pub fn mask_v6(addr: Ipv6Addr, plen: u8) -> Ipv6Addr {
    let bits = u128::from(addr);
    let mask = if plen >= 128 { u128::MAX } else { !0u128 << (128 - plen) };
    Ipv6Addr::from(bits & mask)
}

fn lcaf_type_of(lcaf: &Lcaf) -> u8 {
    match lcaf {
        Lcaf::InstanceId(_) => lcaf_type::INSTANCE_ID,
        Lcaf::AppData(_) => lcaf_type::APPLICATION_DATA,
        Lcaf::NatTraversal(_) => lcaf_type::NAT_TRAVERSAL,
        Lcaf::MulticastInfo(_) => lcaf_type::MULTICAST_INFO,
        Lcaf::ExplicitLocatorPath(_) => lcaf_type::EXPLICIT_LOCATOR_PATH,
    }
}

fn lcaf_body_len(lcaf: &Lcaf) -> usize {
    match lcaf {
        Lcaf::InstanceId(i) => 4 + i.inner.size_on_wire(),
        Lcaf::AppData(a) => 1 + 1 + 2 + 2 + 2 + 2 + a.inner.size_on_wire(),
        Lcaf::MulticastInfo(m) => 4 + 1 + 1 + m.source.size_on_wire() + m.group.size_on_wire(),
        Lcaf::NatTraversal(n) => {
            2 + 2
                + n.global_etr.size_on_wire()
                + n.ms.size_on_wire()
                + n.priv_etr.size_on_wire()
                + 1
                + n.rtr_list.iter().map(Address::size_on_wire).sum::<usize>()
        }
        Lcaf::ExplicitLocatorPath(hops) => {
            hops.iter().map(|h| 1 + h.address.size_on_wire()).sum()
        }
    }
}

fn write_lcaf_body(lcaf: &Lcaf, cursor: &mut CursorMut) -> Result<()> {
    match lcaf {
        Lcaf::InstanceId(i) => {
            cursor.write_u32(i.iid)?;
            i.inner.write_to(cursor)
        }
        Lcaf::AppData(a) => {
            cursor.write_u8(a.protocol)?;
            cursor.write_u8(0)?;
            cursor.write_u16(a.local_port_low)?;
            cursor.write_u16(a.local_port_high)?;
            cursor.write_u16(a.remote_port_low)?;
            cursor.write_u16(a.remote_port_high)?;
            a.inner.write_to(cursor)
        }
        Lcaf::MulticastInfo(m) => {
            cursor.write_u32(m.iid)?;
            cursor.write_u8(m.source_plen)?;
            cursor.write_u8(m.group_plen)?;
            m.source.write_to(cursor)?;
            m.group.write_to(cursor)
        }
        Lcaf::NatTraversal(n) => {
            cursor.write_u16(n.ms_port)?;
            cursor.write_u16(n.etr_port)?;
            n.global_etr.write_to(cursor)?;
            n.ms.write_to(cursor)?;
            n.priv_etr.write_to(cursor)?;
            cursor.write_u8(n.rtr_list.len() as u8)?;
            for rtr in &n.rtr_list {
                rtr.write_to(cursor)?;
            }
            Ok(())
        }
        Lcaf::ExplicitLocatorPath(hops) => {
            for hop in hops {
                cursor.write_u8(hop.flags)?;
                hop.address.write_to(cursor)?;
            }
            Ok(())
        }
    }
}

fn read_lcaf_body(ty: u8, cursor: &mut Cursor) -> Result<Lcaf> {
    match ty {
        lcaf_type::INSTANCE_ID => {
            let iid = cursor.read_u32()?;
            let inner = Address::read_from(cursor)?;
            Ok(Lcaf::InstanceId(InstanceIdInfo {
                iid,
                inner: Box::new(inner),
            }))
        }
        lcaf_type::APPLICATION_DATA => {
            let protocol = cursor.read_u8()?;
            let _rsvd = cursor.read_u8()?;
            let local_port_low = cursor.read_u16()?;
            let local_port_high = cursor.read_u16()?;
            let remote_port_low = cursor.read_u16()?;
            let remote_port_high = cursor.read_u16()?;
            let inner = Address::read_from(cursor)?;
            Ok(Lcaf::AppData(AppDataInfo {
                protocol,
                local_port_low,
                local_port_high,
                remote_port_low,
                remote_port_high,
                inner: Box::new(inner),
            }))
        }
        lcaf_type::MULTICAST_INFO => {
            let iid = cursor.read_u32()?;
            let source_plen = cursor.read_u8()?;
            let group_plen = cursor.read_u8()?;
            let source = Address::read_from(cursor)?;
            let group = Address::read_from(cursor)?;
            Ok(Lcaf::MulticastInfo(MulticastInfo {
                iid,
                source_plen,
                group_plen,
                source: Box::new(source),
                group: Box::new(group),
            }))
        }
        lcaf_type::NAT_TRAVERSAL => {
            let ms_port = cursor.read_u16()?;
            let etr_port = cursor.read_u16()?;
            let global_etr = Address::read_from(cursor)?;
            let ms = Address::read_from(cursor)?;
            let priv_etr = Address::read_from(cursor)?;
            let rtr_count = cursor.read_u8()?;
            let mut rtr_list = Vec::with_capacity(rtr_count as usize);
            for _ in 0..rtr_count {
                rtr_list.push(Address::read_from(cursor)?);
            }
            Ok(Lcaf::NatTraversal(NatTraversalInfo {
                ms_port,
                etr_port,
                global_etr: Box::new(global_etr),
                ms: Box::new(ms),
                priv_etr: Box::new(priv_etr),
                rtr_list,
            }))
        }
        lcaf_type::EXPLICIT_LOCATOR_PATH => {
            let mut hops = Vec::new();
            while cursor.remaining() > 0 {
                let flags = cursor.read_u8()?;
                let address = Address::read_from(cursor)?;
                hops.push(LocatorPathHop {
                    flags,
                    address: Box::new(address),
                });
            }
            Ok(Lcaf::ExplicitLocatorPath(hops))
        }
        other => Err(LispError::UnsupportedLcafType(other)),
    }
}
