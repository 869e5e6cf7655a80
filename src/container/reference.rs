//! A single `(offset, length, flags)` reference into the blob.
//!
//! Flag bit layout:
//!
//! ```text
//! bit 0    : addressing  (0 = absolute, 1 = anchor-relative)
//! bits 1-2 : transform   (0 = none, 1 = xor, 2 = add mod 256)
//! bits 3-7 : 5-bit transform immediate
//! ```
//!
//! In relative mode the offset field holds a signed delta (two's complement)
//! from the session anchor, added modulo the blob size. Relative addressing
//! exists purely to shrink wire size; both sides know the anchor, so
//! correctness is unaffected.

use crate::blob::Blob;
use crate::container::cursor::Cursor;
use crate::error::{BlobError, CodecError};
use bytes::BufMut;

/// Wire size of one reference record: offset u64 + length u32 + flags u8.
pub const RECORD_LEN: usize = 13;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RefFlags: u8 {
        const RELATIVE = 1 << 0;
        const OP_XOR = 1 << 1;
        const OP_ADD = 2 << 1;
    }
}

const OP_MASK: u8 = 0b0000_0110;
const IMM_SHIFT: u8 = 3;

/// Byte transform applied to the bytes read through a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    None,
    Xor(u8),
    Add(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reference {
    pub offset: u64,
    pub length: u32,
    pub flags: u8,
}

impl Reference {
    pub fn absolute(offset: u64, length: u32) -> Self {
        Self {
            offset,
            length,
            flags: 0,
        }
    }

    /// Anchor-relative reference; `delta` is stored as two's complement.
    pub fn relative(delta: i64, length: u32) -> Self {
        Self {
            offset: delta as u64,
            length,
            flags: RefFlags::RELATIVE.bits(),
        }
    }

    /// Attach a transform. Immediates are masked to their 5 wire bits.
    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.flags &= !(OP_MASK | (0b1_1111 << IMM_SHIFT));
        match transform {
            Transform::None => {}
            Transform::Xor(imm) => {
                self.flags |= RefFlags::OP_XOR.bits() | ((imm & 0b1_1111) << IMM_SHIFT);
            }
            Transform::Add(imm) => {
                self.flags |= RefFlags::OP_ADD.bits() | ((imm & 0b1_1111) << IMM_SHIFT);
            }
        }
        self
    }

    pub fn is_relative(&self) -> bool {
        RefFlags::from_bits_retain(self.flags).contains(RefFlags::RELATIVE)
    }

    pub fn transform(&self) -> Transform {
        let imm = self.flags >> IMM_SHIFT;
        match (self.flags & OP_MASK) >> 1 {
            1 => Transform::Xor(imm),
            2 => Transform::Add(imm),
            _ => Transform::None,
        }
    }

    /// Resolve the addressed blob offset for a given anchor and blob size.
    ///
    /// A zero-size blob has no addressable offsets; callers reject reads
    /// against one before getting here.
    pub fn resolved_offset(&self, anchor: u64, blob_size: u64) -> u64 {
        if blob_size == 0 {
            return 0;
        }
        if self.is_relative() {
            let delta = self.offset as i64;
            (anchor as i128 + delta as i128).rem_euclid(blob_size as i128) as u64
        } else {
            self.offset % blob_size
        }
    }

    /// Read this reference's bytes from the blob and apply the transform.
    ///
    /// A zero-length reference contributes nothing.
    pub fn resolve(&self, blob: &Blob, anchor: u64) -> Result<Vec<u8>, BlobError> {
        if self.length == 0 {
            return Ok(Vec::new());
        }
        if blob.size() == 0 {
            return Err(BlobError::ReadTooLong {
                len: self.length as u64,
                size: 0,
            });
        }
        let offset = self.resolved_offset(anchor, blob.size());
        let mut bytes = blob.read(offset, self.length as usize)?;
        match self.transform() {
            Transform::None => {}
            Transform::Xor(imm) => {
                for b in &mut bytes {
                    *b ^= imm;
                }
            }
            Transform::Add(imm) => {
                for b in &mut bytes {
                    *b = b.wrapping_add(imm);
                }
            }
        }
        Ok(bytes)
    }

    /// Append the 13-byte big-endian wire record.
    pub fn encode_record(&self, buf: &mut impl BufMut) {
        buf.put_u64(self.offset);
        buf.put_u32(self.length);
        buf.put_u8(self.flags);
    }

    /// Decode one record, rejecting truncation.
    pub fn decode_record(cursor: &mut Cursor) -> Result<Self, CodecError> {
        let offset = cursor.u64("reference offset")?;
        let length = cursor.u32("reference length")?;
        let flags = cursor.u8("reference flags")?;
        Ok(Self {
            offset,
            length,
            flags,
        })
    }
}

/// Resolve a whole reference list into a window's plaintext.
pub fn resolve_all(refs: &[Reference], blob: &Blob, anchor: u64) -> Result<Vec<u8>, BlobError> {
    let total: usize = refs.iter().map(|r| r.length as usize).sum();
    let mut out = Vec::with_capacity(total);
    for r in refs {
        out.extend_from_slice(&r.resolve(blob, anchor)?);
    }
    Ok(out)
}
