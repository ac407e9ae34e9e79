// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Map-Reply (type 2): fixed header, nonce, and one or more mapping
//! records.

use super::record::MappingRecord;
use crate::constants::msg_type;
use crate::cursor::{Cursor, CursorMut};
use crate::error::{LispError, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct ReplyFlags {
    /// Reply to a probe; echoes the probe's nonce and locator reachability.
    pub probe: bool,
    /// Sent by an ETR that delegated to a map-server (Echo-Nonce capable).
    pub etr: bool,
    /// Security-enabled reply (unused beyond wire fidelity).
    pub security: bool,
}

#[derive(Debug, Clone)]
pub struct MapReply {
    pub flags: ReplyFlags,
    pub nonce: u64,
    pub records: Vec<MappingRecord>,
}

impl MapReply {
    pub fn size_on_wire(&self) -> usize {
        4 + 8 + self.records.iter().map(MappingRecord::size_on_wire).sum::<usize>()
    }

    pub fn write_to(&self, cursor: &mut CursorMut) -> Result<()> {
        let mut byte0 = msg_type::MAP_REPLY << 4;
        if self.flags.probe {
            byte0 |= 0b1000;
        }
        if self.flags.etr {
            byte0 |= 0b0100;
        }
        if self.flags.security {
            byte0 |= 0b0010;
        }
        cursor.write_u8(byte0)?;
        cursor.write_u8(0)?; // reserved
        cursor.write_u8(0)?; // reserved
        cursor.write_u8(self.records.len() as u8)?;
        cursor.write_u64(self.nonce)?;
        for rec in &self.records {
            rec.write_to(cursor)?;
        }
        Ok(())
    }

    pub fn read_from(cursor: &mut Cursor) -> Result<MapReply> {
        let byte0 = cursor.read_u8()?;
        let ty = byte0 >> 4;
        if ty != msg_type::MAP_REPLY {
            return Err(LispError::UnknownType(ty));
        }
        let flags = ReplyFlags {
            probe: byte0 & 0b1000 != 0,
            etr: byte0 & 0b0100 != 0,
            security: byte0 & 0b0010 != 0,
        };
        let _rsvd0 = cursor.read_u8()?;
        let _rsvd1 = cursor.read_u8()?;
        let record_count = cursor.read_u8()?;
        let nonce = cursor.read_u64()?;
        let mut records = Vec::with_capacity(record_count as usize);
        for _ in 0..record_count {
            records.push(MappingRecord::read_from(cursor)?);
        }
        Ok(MapReply { flags, nonce, records })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::Action;
    use std::net::{IpAddr, Ipv4Addr};

    fn sample() -> MapReply {
        MapReply {
            flags: ReplyFlags {
                probe: true,
                ..Default::default()
            },
            nonce: 42,
            records: vec![MappingRecord {
                ttl: 1440,
                mask_len: 24,
                action: Action::NoAction,
                authoritative: true,
                version: 0,
                eid: crate::address::Address::Ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0))),
                locators: vec![],
            }],
        }
    }

    #[test]
    fn map_reply_roundtrips() {
        let rep = sample();
        let mut buf = vec![0u8; rep.size_on_wire()];
        {
            let mut w = CursorMut::new(&mut buf);
            rep.write_to(&mut w).unwrap();
        }
        let mut r = Cursor::new(&buf);
        let got = MapReply::read_from(&mut r).unwrap();
        assert_eq!(got.nonce, 42);
        assert!(got.flags.probe);
        assert_eq!(got.records.len(), 1);
    }

    #[test]
    fn negative_entry_has_zero_locators() {
        let mut rep = sample();
        rep.records[0].action = Action::Drop;
        let mut buf = vec![0u8; rep.size_on_wire()];
        {
            let mut w = CursorMut::new(&mut buf);
            rep.write_to(&mut w).unwrap();
        }
        let mut r = Cursor::new(&buf);
        let got = MapReply::read_from(&mut r).unwrap();
        assert_eq!(got.records[0].locators.len(), 0);
        assert_eq!(got.records[0].action, Action::Drop);
    }
}
