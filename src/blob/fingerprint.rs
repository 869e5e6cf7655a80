//! Blob identity: `(name, size, seed, profile)`.
//!
//! Two endpoints holding the same fingerprint observe identical bytes at
//! identical offsets, by construction. The wire form is
//! `name:size:seed[:profile]`; a missing profile means `prand`.

use crate::error::BlobError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Profile assumed when the wire form carries only three fields.
pub const DEFAULT_PROFILE: &str = "prand";

/// Identity of a dictionary instance. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub name: String,
    pub size: u64,
    pub seed: u32,
    pub profile: String,
}

impl Fingerprint {
    pub fn new(
        name: impl Into<String>,
        size: u64,
        seed: u32,
        profile: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            size,
            seed,
            profile: profile.into(),
        }
    }

    /// Parse the wire form `name:size:seed[:profile]`.
    ///
    /// The name itself may not contain `:`.
    pub fn parse(s: &str) -> Result<Self, BlobError> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 && parts.len() != 4 {
            return Err(BlobError::BadFingerprint {
                input: s.to_string(),
                reason: "expected 3 or 4 colon-separated fields",
            });
        }
        if parts[0].is_empty() {
            return Err(BlobError::BadFingerprint {
                input: s.to_string(),
                reason: "empty name",
            });
        }
        let size: u64 = parts[1].parse().map_err(|_| BlobError::BadFingerprint {
            input: s.to_string(),
            reason: "size is not a u64",
        })?;
        let seed: u32 = parts[2].parse().map_err(|_| BlobError::BadFingerprint {
            input: s.to_string(),
            reason: "seed is not a u32",
        })?;
        let profile = parts.get(3).copied().unwrap_or(DEFAULT_PROFILE);

        Ok(Self::new(parts[0], size, seed, profile))
    }

    /// 24-byte content tag stored in the blob header.
    ///
    /// Any change to the fingerprint changes the tag, which is what makes
    /// `ensure_filled` idempotent across independent attachers.
    pub fn content_tag(&self) -> [u8; 24] {
        let digest = Sha256::digest(self.to_string().as_bytes());
        let mut tag = [0u8; 24];
        tag.copy_from_slice(&digest[..24]);
        tag
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.name, self.size, self.seed, self.profile
        )
    }
}
