// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Control message codecs: one module per LISP message type, plus the
//! shared mapping/locator record format and HMAC auth helper they all use.
//!
//! Dispatch on receipt reads only the top nibble of the first byte
//! (common to every message type) before handing the buffer to the
//! type-specific decoder.

pub mod auth;
pub mod ecm;
pub mod info;
pub mod map_register;
pub mod map_reply;
pub mod map_request;
pub mod record;

use crate::constants::msg_type;
use crate::cursor::Cursor;
use crate::error::{LispError, Result};
use ecm::Ecm;
use info::InfoMessage;
use map_register::{RegisterKind, RegisterMessage};
use map_reply::MapReply;
use map_request::MapRequest;

/// Every control message this daemon can receive on the control port,
/// tagged by which codec produced it.
#[derive(Debug, Clone)]
pub enum ControlMessage {
    Request(MapRequest),
    Reply(MapReply),
    Register(RegisterMessage),
    Notify(RegisterMessage),
    Info(InfoMessage),
}

impl ControlMessage {
    /// Peek the message type nibble and dispatch to the matching decoder.
    /// ECM is handled separately by [`decode_ecm`] since its inner payload
    /// needs to stay borrowed rather than copied into an owned variant.
    pub fn decode(buf: &[u8]) -> Result<ControlMessage> {
        let ty = *buf
            .first()
            .ok_or_else(|| LispError::truncated(0, "empty datagram"))?
            >> 4;
        let mut cursor = Cursor::new(buf);
        match ty {
            msg_type::MAP_REQUEST => Ok(ControlMessage::Request(MapRequest::read_from(&mut cursor)?)),
            msg_type::MAP_REPLY => Ok(ControlMessage::Reply(MapReply::read_from(&mut cursor)?)),
            msg_type::MAP_REGISTER => Ok(ControlMessage::Register(RegisterMessage::read_from(
                &mut cursor,
                RegisterKind::Register,
            )?)),
            msg_type::MAP_NOTIFY => Ok(ControlMessage::Notify(RegisterMessage::read_from(
                &mut cursor,
                RegisterKind::Notify,
            )?)),
            msg_type::INFO => Ok(ControlMessage::Info(InfoMessage::read_from(&mut cursor)?)),
            other => Err(LispError::UnknownType(other)),
        }
    }
}

/// Decode the ECM envelope without touching its inner payload.
pub fn decode_ecm(buf: &[u8]) -> Result<Ecm<'_>> {
    let mut cursor = Cursor::new(buf);
    Ecm::read_from(&mut cursor)
}
