//! The two interchangeable container encodings.
//!
//! `OFFS` is the minimal form: magic, u16 count, then count reference
//! records. `PVRT` is the multi-section form: magic followed by tagged
//! sections (`tag[4] | len:u32 | payload`), carrying an optional raw-bytes
//! section (`RAWB`), an optional legacy protocol section (`PRTO`), and a
//! `BREF` section holding the reference list, its count computed from the
//! section length.

use crate::blob::Blob;
use crate::container::cursor::Cursor;
use crate::container::reference::{resolve_all, Reference, RECORD_LEN};
use crate::error::CodecError;
use anyhow::{Context, Result};
use bytes::{BufMut, Bytes, BytesMut};

pub const OFFS_MAGIC: &[u8; 4] = b"OFFS";
pub const PVRT_MAGIC: &[u8; 4] = b"PVRT";

const SECTION_RAWB: &[u8; 4] = b"RAWB";
const SECTION_PRTO: &[u8; 4] = b"PRTO";
const SECTION_BREF: &[u8; 4] = b"BREF";

// =============================================================================
// OFFS
// =============================================================================

/// Encode a reference list in the minimal tagged-count form.
pub fn encode_offs(refs: &[Reference]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + 2 + refs.len() * RECORD_LEN);
    buf.put_slice(OFFS_MAGIC);
    buf.put_u16(refs.len() as u16);
    for r in refs {
        r.encode_record(&mut buf);
    }
    buf.freeze()
}

/// Decode an OFFS payload, rejecting bad magic and truncated records.
pub fn decode_offs(payload: Bytes) -> Result<Vec<Reference>, CodecError> {
    let mut cursor = Cursor::new(payload);
    let magic = cursor.tag("OFFS magic")?;
    if &magic != OFFS_MAGIC {
        return Err(CodecError::BadMagic {
            expected: "OFFS",
            got: magic,
        });
    }
    let count = cursor.u16("OFFS count")? as usize;
    let mut refs = Vec::with_capacity(count);
    for _ in 0..count {
        refs.push(Reference::decode_record(&mut cursor)?);
    }
    Ok(refs)
}

// =============================================================================
// PVRT
// =============================================================================

/// Decoded PVRT container.
///
/// A window travels as references when the compiler found a plan, as raw
/// bytes when it did not, or (from older senders) as a legacy protocol
/// payload of length-prefixed literal chunks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Container {
    pub refs: Vec<Reference>,
    pub raw: Option<Bytes>,
    pub proto: Option<Bytes>,
}

impl Container {
    pub fn from_refs(refs: Vec<Reference>) -> Self {
        Self {
            refs,
            ..Default::default()
        }
    }

    pub fn from_raw(raw: Bytes) -> Self {
        Self {
            raw: Some(raw),
            ..Default::default()
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_slice(PVRT_MAGIC);

        if let Some(raw) = &self.raw {
            buf.put_slice(SECTION_RAWB);
            buf.put_u32(raw.len() as u32);
            buf.put_slice(raw);
        }
        if let Some(proto) = &self.proto {
            buf.put_slice(SECTION_PRTO);
            buf.put_u32(proto.len() as u32);
            buf.put_slice(proto);
        }
        if !self.refs.is_empty() {
            buf.put_slice(SECTION_BREF);
            buf.put_u32((self.refs.len() * RECORD_LEN) as u32);
            for r in &self.refs {
                r.encode_record(&mut buf);
            }
        }

        buf.freeze()
    }

    pub fn decode(payload: Bytes) -> Result<Self, CodecError> {
        let mut cursor = Cursor::new(payload);
        let magic = cursor.tag("PVRT magic")?;
        if &magic != PVRT_MAGIC {
            return Err(CodecError::BadMagic {
                expected: "PVRT",
                got: magic,
            });
        }

        let mut container = Container::default();
        while !cursor.is_empty() {
            let tag = cursor.tag("section tag")?;
            let len = cursor.u32("section length")? as usize;
            let body = cursor.take("section body", len)?;

            match &tag {
                t if t == SECTION_RAWB => container.raw = Some(body),
                t if t == SECTION_PRTO => container.proto = Some(body),
                t if t == SECTION_BREF => {
                    if len % RECORD_LEN != 0 {
                        return Err(CodecError::RaggedSection {
                            len,
                            record: RECORD_LEN,
                        });
                    }
                    let mut records = Cursor::new(body);
                    let mut refs = Vec::with_capacity(len / RECORD_LEN);
                    while !records.is_empty() {
                        refs.push(Reference::decode_record(&mut records)?);
                    }
                    container.refs = refs;
                }
                _ => return Err(CodecError::UnknownSection { got: tag }),
            }
        }
        Ok(container)
    }

    /// Reconstruct the window plaintext this container describes.
    ///
    /// Reference-based reconstruction via the blob is preferred; raw bytes
    /// and the legacy proto section are fallbacks, in that order.
    pub fn materialize(&self, blob: &Blob, anchor: u64) -> Result<Vec<u8>> {
        if !self.refs.is_empty() {
            return resolve_all(&self.refs, blob, anchor)
                .context("failed to resolve window references");
        }
        if let Some(raw) = &self.raw {
            return Ok(raw.to_vec());
        }
        if let Some(proto) = &self.proto {
            return decode_proto(proto.clone()).context("failed to decode legacy proto section");
        }
        Ok(Vec::new())
    }
}

/// Legacy proto payload: a sequence of `len:u32 | bytes` literal chunks.
pub fn encode_proto(chunks: &[&[u8]]) -> Bytes {
    let total: usize = chunks.iter().map(|c| 4 + c.len()).sum();
    let mut buf = BytesMut::with_capacity(total);
    for chunk in chunks {
        buf.put_u32(chunk.len() as u32);
        buf.put_slice(chunk);
    }
    buf.freeze()
}

fn decode_proto(payload: Bytes) -> Result<Vec<u8>, CodecError> {
    let mut cursor = Cursor::new(payload);
    let mut out = Vec::new();
    while !cursor.is_empty() {
        let len = cursor.u32("proto chunk length")? as usize;
        out.extend_from_slice(&cursor.take("proto chunk", len)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::Fingerprint;
    use crate::container::reference::Transform;
    use proptest::prelude::*;

    fn test_blob() -> Blob {
        let mut blob = Blob::in_memory(Fingerprint::new("t", 8192, 7, "prand"));
        blob.ensure_filled().unwrap();
        blob
    }

    #[test]
    fn test_offs_roundtrip() {
        let refs = vec![
            Reference::absolute(0, 64),
            Reference::relative(-100, 32).with_transform(Transform::Add(3)),
        ];
        let encoded = encode_offs(&refs);
        assert_eq!(decode_offs(encoded).unwrap(), refs);
    }

    #[test]
    fn test_offs_bad_magic() {
        let payload = Bytes::from_static(b"NOPE\x00\x00");
        assert!(matches!(
            decode_offs(payload),
            Err(CodecError::BadMagic { .. })
        ));
    }

    #[test]
    fn test_offs_truncated_record() {
        let refs = vec![Reference::absolute(0, 4)];
        let encoded = encode_offs(&refs);
        let cut = encoded.slice(..encoded.len() - 1);
        assert!(matches!(
            decode_offs(cut),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn test_pvrt_roundtrip_all_sections() {
        let container = Container {
            refs: vec![Reference::absolute(16, 8)],
            raw: Some(Bytes::from_static(b"fallback bytes")),
            proto: Some(encode_proto(&[b"legacy"])),
        };
        let back = Container::decode(container.encode()).unwrap();
        assert_eq!(back, container);
    }

    #[test]
    fn test_pvrt_refs_only() {
        let container = Container::from_refs(vec![Reference::absolute(0, 32)]);
        let back = Container::decode(container.encode()).unwrap();
        assert_eq!(back.refs.len(), 1);
        assert!(back.raw.is_none());
        assert!(back.proto.is_none());
    }

    #[test]
    fn test_pvrt_ragged_bref_rejected() {
        let mut buf = BytesMut::new();
        buf.put_slice(PVRT_MAGIC);
        buf.put_slice(SECTION_BREF);
        buf.put_u32(14); // not a multiple of 13
        buf.put_slice(&[0u8; 14]);
        assert!(matches!(
            Container::decode(buf.freeze()),
            Err(CodecError::RaggedSection { .. })
        ));
    }

    #[test]
    fn test_pvrt_unknown_section_rejected() {
        let mut buf = BytesMut::new();
        buf.put_slice(PVRT_MAGIC);
        buf.put_slice(b"WHAT");
        buf.put_u32(0);
        assert!(matches!(
            Container::decode(buf.freeze()),
            Err(CodecError::UnknownSection { .. })
        ));
    }

    #[test]
    fn test_materialize_prefers_refs() {
        let blob = test_blob();
        let container = Container {
            refs: vec![Reference::absolute(0, 16)],
            raw: Some(Bytes::from_static(b"should not be used")),
            proto: None,
        };
        assert_eq!(
            container.materialize(&blob, 0).unwrap(),
            blob.read(0, 16).unwrap()
        );
    }

    #[test]
    fn test_materialize_raw_fallback() {
        let blob = test_blob();
        let container = Container::from_raw(Bytes::from_static(b"raw window"));
        assert_eq!(container.materialize(&blob, 0).unwrap(), b"raw window");
    }

    #[test]
    fn test_materialize_proto_fallback() {
        let blob = test_blob();
        let container = Container {
            proto: Some(encode_proto(&[b"part one ", b"part two"])),
            ..Default::default()
        };
        assert_eq!(
            container.materialize(&blob, 0).unwrap(),
            b"part one part two"
        );
    }

    proptest! {
        #[test]
        fn prop_offs_roundtrip(
            records in proptest::collection::vec(
                (any::<u64>(), any::<u32>(), any::<u8>()),
                0..64,
            )
        ) {
            let refs: Vec<Reference> = records
                .into_iter()
                .map(|(offset, length, flags)| Reference { offset, length, flags })
                .collect();
            let decoded = decode_offs(encode_offs(&refs)).unwrap();
            prop_assert_eq!(decoded, refs);
        }
    }
}
