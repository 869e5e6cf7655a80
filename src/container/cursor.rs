//! Bounds-checked reader over wire bytes.
//!
//! Every decode path goes through this instead of doing its own offset
//! arithmetic; a short buffer yields a typed truncation error, never an
//! out-of-range index.

use crate::error::CodecError;
use bytes::{Buf, Bytes};

pub struct Cursor {
    buf: Bytes,
}

impl Cursor {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn need(&self, what: &'static str, n: usize) -> Result<(), CodecError> {
        if self.buf.remaining() < n {
            return Err(CodecError::Truncated {
                what,
                need: n,
                have: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn u8(&mut self, what: &'static str) -> Result<u8, CodecError> {
        self.need(what, 1)?;
        Ok(self.buf.get_u8())
    }

    pub fn u16(&mut self, what: &'static str) -> Result<u16, CodecError> {
        self.need(what, 2)?;
        Ok(self.buf.get_u16())
    }

    pub fn u32(&mut self, what: &'static str) -> Result<u32, CodecError> {
        self.need(what, 4)?;
        Ok(self.buf.get_u32())
    }

    pub fn u64(&mut self, what: &'static str) -> Result<u64, CodecError> {
        self.need(what, 8)?;
        Ok(self.buf.get_u64())
    }

    pub fn take(&mut self, what: &'static str, n: usize) -> Result<Bytes, CodecError> {
        self.need(what, n)?;
        Ok(self.buf.copy_to_bytes(n))
    }

    /// Read a 4-byte section or magic tag.
    pub fn tag(&mut self, what: &'static str) -> Result<[u8; 4], CodecError> {
        self.need(what, 4)?;
        let mut tag = [0u8; 4];
        self.buf.copy_to_slice(&mut tag);
        Ok(tag)
    }
}
