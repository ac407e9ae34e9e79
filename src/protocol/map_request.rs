// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Map-Request (type 1): fixed header, source-EID, ITR-RLOC list, and one
//! or more EID records to resolve.

use crate::address::Address;
use crate::constants::msg_type;
use crate::cursor::{Cursor, CursorMut};
use crate::error::{LispError, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct RequestFlags {
    /// Sender is authoritative for the source-EID (rarely used).
    pub authoritative: bool,
    /// Map-Request is a Map-Version-only probe (RFC 6834); unused by this
    /// daemon but decoded/encoded for wire fidelity.
    pub map_version_present: bool,
    /// RLOC-probe request: reply must be unicast directly to the probed
    /// locator rather than through the resolver chain.
    pub probe: bool,
    /// SMR-invoked request.
    pub smr: bool,
    pub smr_invoked: bool,
    pub pitr: bool,
}

#[derive(Debug, Clone)]
pub struct EidRecord {
    pub mask_len: u8,
    pub eid: Address,
}

#[derive(Debug, Clone)]
pub struct MapRequest {
    pub flags: RequestFlags,
    pub nonce: u64,
    pub source_eid: Address,
    pub itr_rlocs: Vec<Address>,
    pub records: Vec<EidRecord>,
}

impl MapRequest {
    pub fn size_on_wire(&self) -> usize {
        4 + 8
            + self.source_eid.size_on_wire()
            + self.itr_rlocs.iter().map(Address::size_on_wire).sum::<usize>()
            + self
                .records
                .iter()
                .map(|r| 2 + r.eid.size_on_wire())
                .sum::<usize>()
    }

    pub fn write_to(&self, cursor: &mut CursorMut) -> Result<()> {
        let f = &self.flags;
        let mut byte0 = (msg_type::MAP_REQUEST) << 4;
        if f.authoritative {
            byte0 |= 0b1000;
        }
        if f.map_version_present {
            byte0 |= 0b0100;
        }
        if f.probe {
            byte0 |= 0b0010;
        }
        if f.smr {
            byte0 |= 0b0001;
        }
        cursor.write_u8(byte0)?;

        let mut byte1 = 0u8;
        if f.smr_invoked {
            byte1 |= 0b1000_0000;
        }
        if f.pitr {
            byte1 |= 0b0100_0000;
        }
        cursor.write_u8(byte1)?;
        cursor.write_u8(self.itr_rlocs.len() as u8)?;
        cursor.write_u8(self.records.len() as u8)?;
        cursor.write_u64(self.nonce)?;
        self.source_eid.write_to(cursor)?;
        for rloc in &self.itr_rlocs {
            rloc.write_to(cursor)?;
        }
        for rec in &self.records {
            cursor.write_u8(0)?; // reserved
            cursor.write_u8(rec.mask_len)?;
            rec.eid.write_to(cursor)?;
        }
        Ok(())
    }

    pub fn read_from(cursor: &mut Cursor) -> Result<MapRequest> {
        let byte0 = cursor.read_u8()?;
        let ty = byte0 >> 4;
        if ty != msg_type::MAP_REQUEST {
            return Err(LispError::UnknownType(ty));
        }
        let flags = RequestFlags {
            authoritative: byte0 & 0b1000 != 0,
            map_version_present: byte0 & 0b0100 != 0,
            probe: byte0 & 0b0010 != 0,
            smr: byte0 & 0b0001 != 0,
            smr_invoked: false,
            pitr: false,
        };
        let byte1 = cursor.read_u8()?;
        let flags = RequestFlags {
            smr_invoked: byte1 & 0b1000_0000 != 0,
            pitr: byte1 & 0b0100_0000 != 0,
            ..flags
        };
        let itr_count = cursor.read_u8()?;
        let record_count = cursor.read_u8()?;
        let nonce = cursor.read_u64()?;
        let source_eid = Address::read_from(cursor)?;
        let mut itr_rlocs = Vec::with_capacity(itr_count as usize);
        for _ in 0..itr_count {
            itr_rlocs.push(Address::read_from(cursor)?);
        }
        let mut records = Vec::with_capacity(record_count as usize);
        for _ in 0..record_count {
            let _rsvd = cursor.read_u8()?;
            let mask_len = cursor.read_u8()?;
            let eid = Address::read_from(cursor)?;
            records.push(EidRecord { mask_len, eid });
        }
        Ok(MapRequest {
            flags,
            nonce,
            source_eid,
            itr_rlocs,
            records,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn sample() -> MapRequest {
        MapRequest {
            flags: RequestFlags {
                probe: true,
                smr_invoked: true,
                ..Default::default()
            },
            nonce: 0xDEAD_BEEF_0000_0001,
            source_eid: Address::Ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))),
            itr_rlocs: vec![Address::Ip(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)))],
            records: vec![EidRecord {
                mask_len: 24,
                eid: Address::Ip(IpAddr::V4(Ipv4Addr::new(10, 1, 0, 0))),
            }],
        }
    }

    #[test]
    fn map_request_roundtrips() {
        let req = sample();
        let mut buf = vec![0u8; req.size_on_wire()];
        {
            let mut w = CursorMut::new(&mut buf);
            req.write_to(&mut w).unwrap();
        }
        let mut r = Cursor::new(&buf);
        let got = MapRequest::read_from(&mut r).unwrap();
        assert_eq!(got.nonce, req.nonce);
        assert_eq!(got.itr_rlocs.len(), 1);
        assert_eq!(got.records.len(), 1);
        assert!(got.flags.probe);
        assert!(got.flags.smr_invoked);
    }

    #[test]
    fn wrong_type_nibble_is_rejected() {
        let mut buf = [0u8; 16];
        buf[0] = 2 << 4; // Map-Reply type, not Map-Request
        let mut r = Cursor::new(&buf);
        assert!(matches!(MapRequest::read_from(&mut r), Err(LispError::UnknownType(2))));
    }
}
