// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Info-Request / Info-Reply (type 7, `R` bit distinguishes direction).
//! The RTR list on a reply is carried as a NAT-Traversal LCAF address, the
//! same shape the address model already uses for a locator's RTR
//! candidates -- there is no separate wire type for it.

use super::auth;
use crate::address::Address;
use crate::constants::msg_type;
use crate::cursor::{Cursor, CursorMut};
use crate::error::{LispError, Result};

#[derive(Debug, Clone)]
pub struct InfoMessage {
    /// `false` = Info-Request, `true` = Info-Reply.
    pub is_reply: bool,
    pub nonce: u64,
    pub key_id: u8,
    pub ttl: u32,
    pub mask_len: u8,
    pub eid: Address,
    /// Present only on a reply; `Address::Lcaf(Lcaf::NatTraversal(..))`
    /// carrying the global address, map-server, private address and RTR
    /// list learned for this locator.
    pub nat_info: Option<Address>,
}

impl InfoMessage {
    pub fn auth_offset() -> usize {
        4 + 8 + 1 + 2
    }

    pub fn size_on_wire(&self) -> Result<usize> {
        let auth_len = auth::auth_data_len(self.key_id)?;
        let nat_len = self.nat_info.as_ref().map(Address::size_on_wire).unwrap_or(0);
        Ok(4 + 8 + 1 + 2 + auth_len + 4 + 1 + 1 + self.eid.size_on_wire() + nat_len)
    }

    pub fn write_to(&self, cursor: &mut CursorMut) -> Result<()> {
        let mut byte0 = msg_type::INFO << 4;
        if self.is_reply {
            byte0 |= 0b1000;
        }
        cursor.write_u8(byte0)?;
        cursor.write_u8(0)?;
        cursor.write_u8(0)?;
        cursor.write_u8(0)?;
        cursor.write_u64(self.nonce)?;
        cursor.write_u8(self.key_id)?;
        let auth_len = auth::auth_data_len(self.key_id)?;
        cursor.write_u16(auth_len as u16)?;
        cursor.write_bytes(&vec![0u8; auth_len])?;
        cursor.write_u32(self.ttl)?;
        cursor.write_u8(self.mask_len)?;
        cursor.write_u8(0)?; // reserved
        self.eid.write_to(cursor)?;
        if let Some(nat) = &self.nat_info {
            nat.write_to(cursor)?;
        }
        Ok(())
    }

    pub fn encode_signed(&self, key: &[u8]) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.size_on_wire()?];
        {
            let mut w = CursorMut::new(&mut buf);
            self.write_to(&mut w)?;
        }
        auth::sign(self.key_id, key, &mut buf, Self::auth_offset())?;
        Ok(buf)
    }

    pub fn read_from(cursor: &mut Cursor) -> Result<InfoMessage> {
        let byte0 = cursor.read_u8()?;
        let ty = byte0 >> 4;
        if ty != msg_type::INFO {
            return Err(LispError::UnknownType(ty));
        }
        let is_reply = byte0 & 0b1000 != 0;
        let _rsvd0 = cursor.read_u8()?;
        let _rsvd1 = cursor.read_u8()?;
        let _rsvd2 = cursor.read_u8()?;
        let nonce = cursor.read_u64()?;
        let key_id = cursor.read_u8()?;
        let auth_len = cursor.read_u16()? as usize;
        let _auth_data = cursor.read_bytes(auth_len)?;
        let ttl = cursor.read_u32()?;
        let mask_len = cursor.read_u8()?;
        let _rsvd = cursor.read_u8()?;
        let eid = Address::read_from(cursor)?;
        let nat_info = if is_reply && cursor.remaining() > 0 {
            Some(Address::read_from(cursor)?)
        } else {
            None
        };
        Ok(InfoMessage {
            is_reply,
            nonce,
            key_id,
            ttl,
            mask_len,
            eid,
            nat_info,
        })
    }

    pub fn verify(&self, key: &[u8], raw: &[u8]) -> Result<()> {
        auth::verify(self.key_id, key, raw, Self::auth_offset())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{Lcaf, NatTraversalInfo};
    use crate::constants::key_id;
    use std::net::{IpAddr, Ipv4Addr};

    fn v4(o: u8) -> Address {
        Address::Ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, o)))
    }

    #[test]
    fn info_request_round_trips() {
        let msg = InfoMessage {
            is_reply: false,
            nonce: 9,
            key_id: key_id::NONE,
            ttl: 0,
            mask_len: 32,
            eid: v4(1),
            nat_info: None,
        };
        let buf = msg.encode_signed(b"").unwrap();
        let mut r = Cursor::new(&buf);
        let got = InfoMessage::read_from(&mut r).unwrap();
        assert!(!got.is_reply);
        assert_eq!(got.nonce, 9);
        assert!(got.nat_info.is_none());
    }

    #[test]
    fn info_reply_carries_nat_traversal_lcaf() {
        let nat = Address::Lcaf(Lcaf::NatTraversal(NatTraversalInfo {
            ms_port: 4342,
            etr_port: 4341,
            global_etr: Box::new(v4(9)),
            ms: Box::new(v4(8)),
            priv_etr: Box::new(v4(1)),
            rtr_list: vec![v4(2), v4(3)],
        }));
        let msg = InfoMessage {
            is_reply: true,
            nonce: 9,
            key_id: key_id::HMAC_SHA1_96,
            ttl: 1440,
            mask_len: 32,
            eid: v4(1),
            nat_info: Some(nat),
        };
        let key = b"secret";
        let buf = msg.encode_signed(key).unwrap();
        let mut r = Cursor::new(&buf);
        let got = InfoMessage::read_from(&mut r).unwrap();
        got.verify(key, &buf).unwrap();
        assert!(got.is_reply);
        match got.nat_info {
            Some(Address::Lcaf(Lcaf::NatTraversal(n))) => assert_eq!(n.rtr_list.len(), 2),
            other => panic!("expected NatTraversal LCAF, got {other:?}"),
        }
    }
}
