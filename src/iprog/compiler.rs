//! Window manifest compilation.

use crate::blob::Blob;
use crate::container::{resolve_all, Reference};
use crate::error::BlobError;
use crate::iprog::store::{RefPlanner, Segment};
use crate::iprog::{hash16, IProg, Window};
use bytes::Bytes;
use sha2::{Digest, Sha256};

/// Compile raw object bytes into an IPROG.
///
/// Each window is offered to the planner; a plan that does not resolve back
/// to the window's exact plaintext is discarded and the window falls back to
/// the raw section.
pub fn compile(
    object_id: impl Into<String>,
    data: &[u8],
    window_size: u32,
    blob: &Blob,
    anchor: u64,
    planner: &dyn RefPlanner,
) -> IProg {
    let mut windows = Vec::new();

    for (index, chunk) in data.chunks(window_size as usize).enumerate() {
        let refs = planner
            .plan(chunk, blob, anchor)
            .filter(|plan| {
                resolve_all(plan, blob, anchor)
                    .map(|bytes| bytes == chunk)
                    .unwrap_or(false)
            })
            .unwrap_or_default();

        let raw = if refs.is_empty() {
            Some(Bytes::copy_from_slice(chunk))
        } else {
            None
        };

        windows.push(Window {
            index: index as u32,
            hash16: hash16(chunk),
            size: chunk.len() as u32,
            refs,
            raw,
        });
    }

    IProg {
        object_id: object_id.into(),
        size: data.len() as u64,
        window_size,
        windows,
        sha256: Sha256::digest(data).into(),
    }
}

/// Compile an object already written into the blob's data region as a
/// segment list. Windows are expressed directly as absolute references;
/// plaintext is materialized through the blob only for hashing.
pub fn compile_from_segments(
    object_id: impl Into<String>,
    segments: &[Segment],
    window_size: u32,
    blob: &Blob,
) -> Result<IProg, BlobError> {
    let size: u64 = segments.iter().map(|s| s.len as u64).sum();
    let mut windows = Vec::new();
    let mut object_hasher = Sha256::new();

    let mut seg_iter = segments.iter().copied();
    let mut current = seg_iter.next();
    let mut consumed = 0u32; // bytes used from `current`

    let mut index = 0u32;
    let mut produced = 0u64;
    while produced < size {
        let want = (size - produced).min(window_size as u64) as u32;
        let mut refs = Vec::new();
        let mut remaining = want;

        while remaining > 0 {
            let seg = current.expect("segment list shorter than its declared size");
            let left = seg.len - consumed;
            let take = left.min(remaining);
            refs.push(Reference::absolute(seg.offset + consumed as u64, take));
            consumed += take;
            remaining -= take;
            if consumed == seg.len {
                current = seg_iter.next();
                consumed = 0;
            }
        }

        // Anchor is irrelevant here: every reference is absolute.
        let plaintext = resolve_all(&refs, blob, 0)?;
        object_hasher.update(&plaintext);

        windows.push(Window {
            index,
            hash16: hash16(&plaintext),
            size: want,
            refs,
            raw: None,
        });
        index += 1;
        produced += want as u64;
    }

    Ok(IProg {
        object_id: object_id.into(),
        size,
        window_size,
        windows,
        sha256: object_hasher.finalize().into(),
    })
}
