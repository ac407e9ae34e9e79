// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Encapsulated Control Message (type 8): a lightweight outer header
//! wrapping an inner IP+UDP+control message. The inner message is left
//! encoded -- decoding it is the caller's job, once the outer envelope has
//! told the event loop which source/destination it claims to be from.

use crate::address::Address;
use crate::constants::msg_type;
use crate::cursor::{Cursor, CursorMut};
use crate::error::{LispError, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct EcmFlags {
    pub secure: bool,
    pub ddt: bool,
}

#[derive(Debug, Clone)]
pub struct Ecm<'a> {
    pub flags: EcmFlags,
    pub inner_src: Address,
    pub inner_src_port: u16,
    pub inner_dst: Address,
    pub inner_dst_port: u16,
    pub inner_message: &'a [u8],
}

impl<'a> Ecm<'a> {
    pub fn size_on_wire(&self) -> usize {
        4 + self.inner_src.size_on_wire()
            + 2
            + self.inner_dst.size_on_wire()
            + 2
            + self.inner_message.len()
    }

    pub fn write_to(&self, cursor: &mut CursorMut) -> Result<()> {
        let mut byte0 = msg_type::ENCAP_CONTROL << 4;
        if self.flags.secure {
            byte0 |= 0b1000;
        }
        if self.flags.ddt {
            byte0 |= 0b0100;
        }
        cursor.write_u8(byte0)?;
        cursor.write_u8(0)?;
        cursor.write_u8(0)?;
        cursor.write_u8(0)?;
        self.inner_src.write_to(cursor)?;
        cursor.write_u16(self.inner_src_port)?;
        self.inner_dst.write_to(cursor)?;
        cursor.write_u16(self.inner_dst_port)?;
        cursor.write_bytes(self.inner_message)
    }

    pub fn read_from(cursor: &mut Cursor<'a>) -> Result<Ecm<'a>> {
        let byte0 = cursor.read_u8()?;
        let ty = byte0 >> 4;
        if ty != msg_type::ENCAP_CONTROL {
            return Err(LispError::UnknownType(ty));
        }
        let flags = EcmFlags {
            secure: byte0 & 0b1000 != 0,
            ddt: byte0 & 0b0100 != 0,
        };
        let _rsvd0 = cursor.read_u8()?;
        let _rsvd1 = cursor.read_u8()?;
        let _rsvd2 = cursor.read_u8()?;
        let inner_src = Address::read_from(cursor)?;
        let inner_src_port = cursor.read_u16()?;
        let inner_dst = Address::read_from(cursor)?;
        let inner_dst_port = cursor.read_u16()?;
        let inner_message = cursor.read_bytes(cursor.remaining())?;
        Ok(Ecm {
            flags,
            inner_src,
            inner_src_port,
            inner_dst,
            inner_dst_port,
            inner_message,
        })
    }
}
