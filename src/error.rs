// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crate-wide error type.
//!
//! Every fallible operation in this crate -- codec, database, socket, and
//! configuration -- returns [`LispError`]. Subsystems do not define their
//! own error enums; the recovery policy in each caller (drop-and-log,
//! retransmit-deferral, fatal) is driven by matching on the variant here,
//! not by the error's source module.

use std::fmt;

pub type Result<T> = std::result::Result<T, LispError>;

#[derive(Debug, thiserror::Error)]
pub enum LispError {
    #[error("unknown or unsupported address family identifier: {0}")]
    BadAfi(u16),

    #[error("unsupported LCAF type: {0}")]
    UnsupportedLcafType(u8),

    #[error("buffer truncated at offset {offset}: {reason}")]
    Truncated { offset: usize, reason: String },

    #[error("HMAC authentication failed (key-id {key_id})")]
    BadAuth { key_id: u8 },

    #[error("unknown control message type: {0}")]
    UnknownType(u8),

    #[error("record count mismatch: header said {declared}, found {actual}")]
    RecordCountMismatch { declared: u16, actual: usize },

    #[error("entry already exists")]
    AlreadyExists,

    #[error("entry not found")]
    NotFound,

    #[error("allocation failed: {0}")]
    AllocFailure(String),

    #[error("socket error: {0}")]
    SocketError(#[from] std::io::Error),

    #[error("control interface missing: {0}")]
    ControlInterfaceMissing(String),

    #[error("NAT status unknown, cannot register yet")]
    NatStatusUnknown,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("accessed address variant as {expected} but it is {actual}")]
    WrongAddressKind {
        expected: &'static str,
        actual: &'static str,
    },
}

impl LispError {
    pub fn truncated(offset: usize, reason: impl fmt::Display) -> Self {
        LispError::Truncated {
            offset,
            reason: reason.to_string(),
        }
    }
}
