// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Control-message authentication: HMAC over the whole message with the
//! auth-data field zeroed for the duration of the computation.

use crate::constants::{key_id, LISP_SHA1_AUTH_DATA_LEN, LISP_SHA256_AUTH_DATA_LEN};
use crate::error::{LispError, Result};
use ring::hmac;

pub fn auth_data_len(key_id: u8) -> Result<usize> {
    match key_id {
        self::key_id::NONE => Ok(0),
        self::key_id::HMAC_SHA1_96 => Ok(LISP_SHA1_AUTH_DATA_LEN),
        self::key_id::HMAC_SHA256_128 => Ok(LISP_SHA256_AUTH_DATA_LEN),
        other => Err(LispError::BadAuth { key_id: other }),
    }
}

fn algorithm(key_id: u8) -> Result<hmac::Algorithm> {
    match key_id {
        self::key_id::HMAC_SHA1_96 => Ok(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY),
        self::key_id::HMAC_SHA256_128 => Ok(hmac::HMAC_SHA256),
        other => Err(LispError::BadAuth { key_id: other }),
    }
}

/// Compute the HMAC over `message` with the `auth_data_len`-byte field at
/// `auth_offset` treated as zero, and patch the real digest into that
/// field in place. `message` must already have the field's bytes
/// zero-filled by the caller's header-construction step.
pub fn sign(key_id: u8, key: &[u8], message: &mut [u8], auth_offset: usize) -> Result<()> {
    if key_id == self::key_id::NONE {
        return Ok(());
    }
    let alg = algorithm(key_id)?;
    let len = auth_data_len(key_id)?;
    debug_assert!(message[auth_offset..auth_offset + len].iter().all(|&b| b == 0));
    let hmac_key = hmac::Key::new(alg, key);
    let tag = hmac::sign(&hmac_key, message);
    message[auth_offset..auth_offset + len].copy_from_slice(&tag.as_ref()[..len]);
    Ok(())
}

/// Verify `message`'s HMAC: zero the auth-data field in a scratch copy,
/// recompute, and compare in constant time against the bytes that were
/// actually on the wire.
pub fn verify(key_id: u8, key: &[u8], message: &[u8], auth_offset: usize) -> Result<()> {
    if key_id == self::key_id::NONE {
        return Ok(());
    }
    let alg = algorithm(key_id)?;
    let len = auth_data_len(key_id)?;
    let mut scratch = message.to_vec();
    let received = message[auth_offset..auth_offset + len].to_vec();
    scratch[auth_offset..auth_offset + len].fill(0);
    let hmac_key = hmac::Key::new(alg, key);
    let tag = hmac::sign(&hmac_key, &scratch);
    if ring::constant_time::verify_slices_are_equal(&tag.as_ref()[..len], &received).is_err() {
        return Err(LispError::BadAuth { key_id });
    }
    Ok(())
}
