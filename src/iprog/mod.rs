//! The object program: how to reconstruct an object from windows.
//!
//! An IPROG is compiled once (from raw input bytes matched against the blob,
//! or from segments already sitting in an append log) and is read-only after
//! that. The sync protocol consumes it as the sole description of an object.

pub mod compiler;
pub mod store;

pub use compiler::{compile, compile_from_segments};
pub use store::{NoPlanner, ObjectStore, RefPlanner, Segment};

use crate::container::{Container, Reference};
use bytes::Bytes;
use sha2::{Digest, Sha256};

/// One fixed-size slice of the object (the last window may be short).
#[derive(Debug, Clone)]
pub struct Window {
    pub index: u32,
    /// First 16 bytes of SHA-256 over the reconstructed plaintext.
    /// Truncation is intentional: this is a negotiation and verification
    /// aid, not a security boundary.
    pub hash16: [u8; 16],
    pub size: u32,
    pub refs: Vec<Reference>,
    /// Raw fallback for windows the planner could not express as references.
    pub raw: Option<Bytes>,
}

impl Window {
    /// The container payload sent on the wire for this window.
    pub fn container(&self) -> Container {
        if !self.refs.is_empty() {
            Container::from_refs(self.refs.clone())
        } else {
            Container::from_raw(self.raw.clone().unwrap_or_default())
        }
    }
}

/// Truncated window hash.
pub fn hash16(plaintext: &[u8]) -> [u8; 16] {
    let digest = Sha256::digest(plaintext);
    let mut h = [0u8; 16];
    h.copy_from_slice(&digest[..16]);
    h
}

/// Compiled manifest for one object.
#[derive(Debug, Clone)]
pub struct IProg {
    pub object_id: String,
    pub size: u64,
    pub window_size: u32,
    pub windows: Vec<Window>,
    pub sha256: [u8; 32],
}

impl IProg {
    pub fn total_windows(&self) -> u32 {
        self.windows.len() as u32
    }

    pub fn sha_hex(&self) -> String {
        hex::encode(self.sha256)
    }
}
