// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bounds-checked big-endian read/write cursors for LISP control-message
//! buffers.
//!
//! Shaped after the teacher's CDR2 little-endian cursor pair
//! (`core::ser::cursor::{Cursor, CursorMut}`), but network-order: every
//! LISP wire field (RFC 6830/6833) is transmitted big-endian.

use crate::error::LispError;

type Result<T> = std::result::Result<T, LispError>;

macro_rules! impl_write_be {
    ($name:ident, $type:ty, $size:expr) => {
        pub fn $name(&mut self, value: $type) -> Result<()> {
            if self.offset + $size > self.buffer.len() {
                return Err(LispError::truncated(self.offset, "buffer too small to write"));
            }
            let bytes = value.to_be_bytes();
            self.buffer[self.offset..self.offset + $size].copy_from_slice(&bytes);
            self.offset += $size;
            Ok(())
        }
    };
}

macro_rules! impl_read_be {
    ($name:ident, $type:ty, $size:expr) => {
        pub fn $name(&mut self) -> Result<$type> {
            if self.offset + $size > self.buffer.len() {
                return Err(LispError::truncated(self.offset, "unexpected end of buffer"));
            }
            let mut bytes = [0u8; $size];
            bytes.copy_from_slice(&self.buffer[self.offset..self.offset + $size]);
            self.offset += $size;
            Ok(<$type>::from_be_bytes(bytes))
        }
    };
}

/// Mutable cursor for writing (bounds-checked, zero-copy).
pub struct CursorMut<'a> {
    buffer: &'a mut [u8],
    offset: usize,
}

impl<'a> CursorMut<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self { buffer, offset: 0 }
    }

    impl_write_be!(write_u8, u8, 1);
    impl_write_be!(write_u16, u16, 2);
    impl_write_be!(write_u32, u32, 4);
    impl_write_be!(write_u64, u64, 8);

    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        if self.offset + data.len() > self.buffer.len() {
            return Err(LispError::truncated(self.offset, "buffer too small to write bytes"));
        }
        self.buffer[self.offset..self.offset + data.len()].copy_from_slice(data);
        self.offset += data.len();
        Ok(())
    }

    /// Overwrite `data.len()` bytes starting at `at`, without moving the
    /// cursor. Used to patch the auth-data field with an HMAC after the
    /// rest of the message has been serialized.
    pub fn patch_bytes(&mut self, at: usize, data: &[u8]) -> Result<()> {
        if at + data.len() > self.buffer.len() {
            return Err(LispError::truncated(at, "patch out of bounds"));
        }
        self.buffer[at..at + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn finish(self) -> &'a mut [u8] {
        &mut self.buffer[..self.offset]
    }
}

/// Read-only cursor.
pub struct Cursor<'a> {
    buffer: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, offset: 0 }
    }

    impl_read_be!(read_u8, u8, 1);
    impl_read_be!(read_u16, u16, 2);
    impl_read_be!(read_u32, u32, 4);
    impl_read_be!(read_u64, u64, 8);

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.offset + n > self.buffer.len() {
            return Err(LispError::truncated(self.offset, "unexpected end of buffer"));
        }
        let slice = &self.buffer[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.offset)
    }

    pub fn peek_u8(&self) -> Result<u8> {
        self.buffer
            .get(self.offset)
            .copied()
            .ok_or_else(|| LispError::truncated(self.offset, "unexpected end of buffer"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let mut buf = [0u8; 32];
        {
            let mut w = CursorMut::new(&mut buf);
            w.write_u16(0x1234).unwrap();
            w.write_u32(0xdead_beef).unwrap();
            w.write_u64(0x0102_0304_0506_0708).unwrap();
            w.write_bytes(&[1, 2, 3]).unwrap();
        }
        let mut r = Cursor::new(&buf);
        assert_eq!(r.read_u16().unwrap(), 0x1234);
        assert_eq!(r.read_u32().unwrap(), 0xdead_beef);
        assert_eq!(r.read_u64().unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(r.read_bytes(3).unwrap(), &[1, 2, 3]);
    }

    #[test]
    fn write_past_end_fails() {
        let mut buf = [0u8; 1];
        let mut w = CursorMut::new(&mut buf);
        assert!(w.write_u16(1).is_err());
    }

    #[test]
    fn patch_bytes_overwrites_without_moving_cursor() {
        let mut buf = [0u8; 8];
        let mut w = CursorMut::new(&mut buf);
        w.write_u32(0).unwrap();
        let off = w.offset();
        w.write_u32(0).unwrap();
        w.patch_bytes(0, &[0xff, 0xff, 0xff, 0xff]).unwrap();
        assert_eq!(w.offset(), off + 4);
        let out = w.finish();
        assert_eq!(&out[0..4], &[0xff, 0xff, 0xff, 0xff]);
    }
}
