//! Collaborator seams around the compiler.
//!
//! The reference search strategy and the append-only object store are
//! external concerns; the compiler only needs these interfaces.

use crate::blob::Blob;
use crate::container::Reference;
use anyhow::Result;

/// A contiguous run of bytes inside the blob's data region, as handed out
/// by an append-only allocator. Runs may wrap past the end of the region;
/// wraparound reads make that transparent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub offset: u64,
    pub len: u32,
}

/// Search strategy seam: given window plaintext, produce zero or more
/// references that together reconstruct it, or report failure (`None`).
///
/// The compiler verifies any returned plan by resolving it, so a planner
/// may be heuristic without risking correctness.
pub trait RefPlanner {
    fn plan(&self, window: &[u8], blob: &Blob, anchor: u64) -> Option<Vec<Reference>>;
}

/// Planner that never finds a plan; every window falls back to raw bytes.
pub struct NoPlanner;

impl RefPlanner for NoPlanner {
    fn plan(&self, _window: &[u8], _blob: &Blob, _anchor: u64) -> Option<Vec<Reference>> {
        None
    }
}

/// Append-only object store interface.
///
/// `write_bytes` appends and returns the segment list describing where the
/// bytes landed (possibly wrapping past the end of the region while
/// preserving the reserved header); `read_segments` reads them back.
pub trait ObjectStore {
    fn write_bytes(&mut self, data: &[u8]) -> Result<Vec<Segment>>;
    fn read_segments(&self, segments: &[Segment]) -> Result<Vec<u8>>;
}
