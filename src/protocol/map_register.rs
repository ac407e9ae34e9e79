// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Map-Register (type 3) and Map-Notify (type 4): identical wire shape,
//! differing only in the meaning of the `P` bit and which direction they
//! travel. Both carry an HMAC computed over the whole message with the
//! auth-data field zeroed, and both may append an xTR-ID/site-ID pair
//! after the mapping records when `xtr_id_present` is set.

use super::auth;
use super::record::MappingRecord;
use crate::constants::msg_type;
use crate::cursor::{Cursor, CursorMut};
use crate::error::{LispError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterKind {
    Register,
    Notify,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RegisterFlags {
    /// Map-Register only: ask the map-server to proxy-reply on our behalf.
    pub proxy_reply: bool,
    /// xTR-ID/site-ID trailer is present after the mapping records.
    pub xtr_id_present: bool,
    /// Sent by an RTR registering on behalf of a NATed xTR.
    pub rtr: bool,
}

#[derive(Debug, Clone)]
pub struct RegisterMessage {
    pub kind: RegisterKind,
    pub flags: RegisterFlags,
    pub nonce: u64,
    pub key_id: u8,
    pub records: Vec<MappingRecord>,
    pub xtr_id: Option<[u8; 16]>,
    pub site_id: Option<[u8; 8]>,
}

impl RegisterMessage {
    /// Offset into the serialized buffer of the start of the auth-data
    /// field, needed by callers that sign/verify after encoding.
    ///
    /// Layout up to this point: type/flags byte, reserved byte, record
    /// count byte, nonce (8), key-id (1), auth-data-len (2).
    pub fn auth_offset() -> usize {
        1 + 1 + 1 + 8 + 1 + 2
    }

    pub fn size_on_wire(&self) -> Result<usize> {
        let auth_len = auth::auth_data_len(self.key_id)?;
        let trailer = if self.flags.xtr_id_present { 16 + 8 } else { 0 };
        Ok(1 + 1
            + 1
            + 8
            + 1
            + 2
            + auth_len
            + self.records.iter().map(MappingRecord::size_on_wire).sum::<usize>()
            + trailer)
    }

    fn type_code(&self) -> u8 {
        match self.kind {
            RegisterKind::Register => msg_type::MAP_REGISTER,
            RegisterKind::Notify => msg_type::MAP_NOTIFY,
        }
    }

    pub fn write_to(&self, cursor: &mut CursorMut) -> Result<()> {
        let mut byte0 = self.type_code() << 4;
        if self.flags.proxy_reply {
            byte0 |= 0b0100;
        }
        if self.flags.xtr_id_present {
            byte0 |= 0b0010;
        }
        if self.flags.rtr {
            byte0 |= 0b0001;
        }
        cursor.write_u8(byte0)?;
        cursor.write_u8(0)?; // reserved
        cursor.write_u8(self.records.len() as u8)?;
        cursor.write_u64(self.nonce)?;
        cursor.write_u8(self.key_id)?;
        let auth_len = auth::auth_data_len(self.key_id)?;
        cursor.write_u16(auth_len as u16)?;
        cursor.write_bytes(&vec![0u8; auth_len])?;
        for rec in &self.records {
            rec.write_to(cursor)?;
        }
        if self.flags.xtr_id_present {
            let xtr_id = self.xtr_id.ok_or(LispError::Truncated {
                offset: cursor.offset(),
                reason: "xtr_id_present set without an xtr_id value".into(),
            })?;
            let site_id = self.site_id.ok_or(LispError::Truncated {
                offset: cursor.offset(),
                reason: "xtr_id_present set without a site_id value".into(),
            })?;
            cursor.write_bytes(&xtr_id)?;
            cursor.write_bytes(&site_id)?;
        }
        Ok(())
    }

    /// Serialize and sign in one step: encodes with a zeroed auth-data
    /// field, then patches in the HMAC over the complete buffer.
    pub fn encode_signed(&self, key: &[u8]) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.size_on_wire()?];
        {
            let mut w = CursorMut::new(&mut buf);
            self.write_to(&mut w)?;
        }
        auth::sign(self.key_id, key, &mut buf, Self::auth_offset())?;
        Ok(buf)
    }

    pub fn read_from(cursor: &mut Cursor, expected_kind: RegisterKind) -> Result<RegisterMessage> {
        let byte0 = cursor.read_u8()?;
        let ty = byte0 >> 4;
        let expected_ty = match expected_kind {
            RegisterKind::Register => msg_type::MAP_REGISTER,
            RegisterKind::Notify => msg_type::MAP_NOTIFY,
        };
        if ty != expected_ty {
            return Err(LispError::UnknownType(ty));
        }
        let flags = RegisterFlags {
            proxy_reply: byte0 & 0b0100 != 0,
            xtr_id_present: byte0 & 0b0010 != 0,
            rtr: byte0 & 0b0001 != 0,
        };
        let _rsvd = cursor.read_u8()?;
        let record_count = cursor.read_u8()?;
        let nonce = cursor.read_u64()?;
        let key_id = cursor.read_u8()?;
        let auth_len = cursor.read_u16()? as usize;
        let _auth_data = cursor.read_bytes(auth_len)?;
        let mut records = Vec::with_capacity(record_count as usize);
        for _ in 0..record_count {
            records.push(MappingRecord::read_from(cursor)?);
        }
        let (xtr_id, site_id) = if flags.xtr_id_present {
            let xtr_bytes = cursor.read_bytes(16)?;
            let site_bytes = cursor.read_bytes(8)?;
            let mut xtr_id = [0u8; 16];
            let mut site_id = [0u8; 8];
            xtr_id.copy_from_slice(xtr_bytes);
            site_id.copy_from_slice(site_bytes);
            (Some(xtr_id), Some(site_id))
        } else {
            (None, None)
        };
        Ok(RegisterMessage {
            kind: expected_kind,
            flags,
            nonce,
            key_id,
            records,
            xtr_id,
            site_id,
        })
    }

    /// Verify the message's HMAC against `raw`, the exact bytes it was
    /// received in.
    pub fn verify(&self, key: &[u8], raw: &[u8]) -> Result<()> {
        auth::verify(self.key_id, key, raw, Self::auth_offset())
    }
}
