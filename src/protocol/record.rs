// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The mapping record and locator record shared by Map-Reply, Map-Register
//! and Map-Notify bodies.

use crate::address::Address;
use crate::cursor::{Cursor, CursorMut};
use crate::error::Result;
use crate::mapping::Action;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatorRecord {
    pub priority: u8,
    pub weight: u8,
    pub mpriority: u8,
    pub mweight: u8,
    /// Set when the locator is one of the sender's own (local) RLOCs.
    pub local: bool,
    /// Set on a Map-Reply sent in answer to an RLOC probe.
    pub probed: bool,
    pub reachable: bool,
    pub address: Address,
}

impl LocatorRecord {
    fn flags_byte(&self) -> u8 {
        let mut b = 0u8;
        if self.local {
            b |= 0b0000_0100;
        }
        if self.probed {
            b |= 0b0000_0010;
        }
        if self.reachable {
            b |= 0b0000_0001;
        }
        b
    }

    fn size_on_wire(&self) -> usize {
        1 + 1 + 1 + 1 + 1 + 1 + self.address.size_on_wire()
    }

    fn write_to(&self, cursor: &mut CursorMut) -> Result<()> {
        cursor.write_u8(self.priority)?;
        cursor.write_u8(self.weight)?;
        cursor.write_u8(self.mpriority)?;
        cursor.write_u8(self.mweight)?;
        cursor.write_u8(0)?; // unused
        cursor.write_u8(self.flags_byte())?;
        self.address.write_to(cursor)
    }

    fn read_from(cursor: &mut Cursor) -> Result<LocatorRecord> {
        let priority = cursor.read_u8()?;
        let weight = cursor.read_u8()?;
        let mpriority = cursor.read_u8()?;
        let mweight = cursor.read_u8()?;
        let _unused = cursor.read_u8()?;
        let flags = cursor.read_u8()?;
        let address = Address::read_from(cursor)?;
        Ok(LocatorRecord {
            priority,
            weight,
            mpriority,
            mweight,
            local: flags & 0b0000_0100 != 0,
            probed: flags & 0b0000_0010 != 0,
            reachable: flags & 0b0000_0001 != 0,
            address,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingRecord {
    pub ttl: u32,
    pub mask_len: u8,
    pub action: Action,
    pub authoritative: bool,
    pub version: u16,
    pub eid: Address,
    pub locators: Vec<LocatorRecord>,
}

impl MappingRecord {
    pub fn size_on_wire(&self) -> usize {
        4 + 1 + 1 + 1 + 1 + 1 + 1 + self.eid.size_on_wire()
            + self.locators.iter().map(LocatorRecord::size_on_wire).sum::<usize>()
    }

    pub fn write_to(&self, cursor: &mut CursorMut) -> Result<()> {
        cursor.write_u32(self.ttl)?;
        cursor.write_u8(self.locators.len() as u8)?;
        cursor.write_u8(self.mask_len)?;
        let action_authoritative = (self.action.to_wire() << 5) | if self.authoritative { 0x10 } else { 0 };
        cursor.write_u8(action_authoritative)?;
        cursor.write_u8(0)?; // reserved
        let version = self.version & 0x0FFF;
        cursor.write_u8(((version >> 8) as u8) << 4)?;
        cursor.write_u8((version & 0xFF) as u8)?;
        self.eid.write_to(cursor)?;
        for loc in &self.locators {
            loc.write_to(cursor)?;
        }
        Ok(())
    }

    pub fn read_from(cursor: &mut Cursor) -> Result<MappingRecord> {
        let ttl = cursor.read_u32()?;
        let locator_count = cursor.read_u8()?;
        let mask_len = cursor.read_u8()?;
        let action_authoritative = cursor.read_u8()?;
        let _rsvd = cursor.read_u8()?;
        let version_hi = cursor.read_u8()?;
        let version_lo = cursor.read_u8()?;
        let version = (((version_hi >> 4) as u16) << 8) | version_lo as u16;
        let eid = Address::read_from(cursor)?;
        let mut locators = Vec::with_capacity(locator_count as usize);
        for _ in 0..locator_count {
            locators.push(LocatorRecord::read_from(cursor)?);
        }
        Ok(MappingRecord {
            ttl,
            mask_len,
            action: Action::from_wire(action_authoritative >> 5),
            authoritative: action_authoritative & 0x10 != 0,
            version,
            eid,
            locators,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn sample_record() -> MappingRecord {
        MappingRecord {
            ttl: 1440,
            mask_len: 24,
            action: Action::SendMapRequest,
            authoritative: true,
            version: 0xAB,
            eid: Address::Ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0))),
            locators: vec![LocatorRecord {
                priority: 1,
                weight: 50,
                mpriority: 1,
                mweight: 50,
                local: true,
                probed: false,
                reachable: true,
                address: Address::Ip(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1))),
            }],
        }
    }

    #[test]
    fn mapping_record_roundtrips() {
        let rec = sample_record();
        let mut buf = vec![0u8; rec.size_on_wire()];
        {
            let mut w = CursorMut::new(&mut buf);
            rec.write_to(&mut w).unwrap();
        }
        let mut r = Cursor::new(&buf);
        let got = MappingRecord::read_from(&mut r).unwrap();
        assert_eq!(got, rec);
    }

    #[test]
    fn action_and_authoritative_bit_survive_packing() {
        let mut rec = sample_record();
        rec.action = Action::Drop;
        rec.authoritative = false;
        let mut buf = vec![0u8; rec.size_on_wire()];
        {
            let mut w = CursorMut::new(&mut buf);
            rec.write_to(&mut w).unwrap();
        }
        let mut r = Cursor::new(&buf);
        let got = MappingRecord::read_from(&mut r).unwrap();
        assert_eq!(got.action, Action::Drop);
        assert!(!got.authoritative);
    }
}
