//! Blob creation, attachment, and the idempotent deterministic fill.
//!
//! A blob is `HEADER_LEN` bytes of tag header followed by `size` data bytes.
//! Reference offsets address the data region only. The header records which
//! fingerprint's content the data region currently holds, so any number of
//! independent processes can attach and call `ensure_filled` without
//! re-deriving an already-correct dictionary.

use crate::blob::circular::CircularBuffer;
use crate::blob::fingerprint::Fingerprint;
use crate::blob::generator::fill_profile;
use crate::error::BlobError;
use memmap2::MmapMut;
use std::fmt;
use std::fs::OpenOptions;
use std::path::Path;

/// Reserved header region: 8-byte id tag + 24-byte content tag.
pub const HEADER_LEN: usize = 32;

const ID_TAG: &[u8; 8] = b"BSYNCDCT";

enum Backing {
    Memory(Vec<u8>),
    Mapped(MmapMut),
}

impl Backing {
    fn bytes(&self) -> &[u8] {
        match self {
            Backing::Memory(v) => v,
            Backing::Mapped(m) => m,
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match self {
            Backing::Memory(v) => v,
            Backing::Mapped(m) => m,
        }
    }
}

/// A dictionary instance. Read-only from the protocol's point of view once
/// filled; reads are safe from any number of sessions concurrently.
pub struct Blob {
    fingerprint: Fingerprint,
    backing: Backing,
    fills: u64,
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("fingerprint", &self.fingerprint)
            .field(
                "backing",
                match &self.backing {
                    Backing::Memory(_) => &"memory",
                    Backing::Mapped(_) => &"mapped",
                },
            )
            .field("filled", &self.is_filled())
            .finish()
    }
}

impl Blob {
    /// Anonymous in-process buffer. Used by tests and single-process setups.
    pub fn in_memory(fingerprint: Fingerprint) -> Self {
        let len = HEADER_LEN + fingerprint.size as usize;
        Self {
            fingerprint,
            backing: Backing::Memory(vec![0u8; len]),
            fills: 0,
        }
    }

    /// Attach to (or create) the shared file-backed buffer for
    /// `fingerprint.name` under `dir`.
    ///
    /// Fails with [`BlobError::Capacity`] if an existing buffer is smaller
    /// than the requested size; attaching to a larger one is fine.
    pub fn create_or_attach(
        dir: &Path,
        fingerprint: &Fingerprint,
        create: bool,
    ) -> Result<Self, BlobError> {
        let path = dir.join(format!("{}.blob", fingerprint.name));
        let needed = HEADER_LEN as u64 + fingerprint.size;

        let exists = path.exists();
        if !exists && !create {
            return Err(BlobError::NotFound {
                name: fingerprint.name.clone(),
            });
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(&path)?;

        let len = file.metadata()?.len();
        if exists && len < needed {
            return Err(BlobError::Capacity {
                name: fingerprint.name.clone(),
                existing: len.saturating_sub(HEADER_LEN as u64),
                requested: fingerprint.size,
            });
        }
        if len < needed {
            file.set_len(needed)?;
        }

        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            fingerprint: fingerprint.clone(),
            backing: Backing::Mapped(mmap),
            fills: 0,
        })
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn size(&self) -> u64 {
        self.fingerprint.size
    }

    /// Number of expensive fills this handle has performed. Test hook for
    /// the idempotence property.
    pub fn fill_count(&self) -> u64 {
        self.fills
    }

    fn data(&self) -> &[u8] {
        let end = HEADER_LEN + self.fingerprint.size as usize;
        &self.backing.bytes()[HEADER_LEN..end]
    }

    fn data_mut(&mut self) -> &mut [u8] {
        let end = HEADER_LEN + self.fingerprint.size as usize;
        &mut self.backing.bytes_mut()[HEADER_LEN..end]
    }

    /// Whether the header already carries this fingerprint's content tag.
    pub fn is_filled(&self) -> bool {
        let header = &self.backing.bytes()[..HEADER_LEN];
        &header[..8] == ID_TAG && header[8..] == self.fingerprint.content_tag()
    }

    /// Derive the dictionary content if the buffer does not already hold it.
    ///
    /// Idempotent: a second call on a correctly-tagged buffer performs zero
    /// writes. Returns whether a fill happened.
    pub fn ensure_filled(&mut self) -> Result<bool, BlobError> {
        if self.is_filled() {
            return Ok(false);
        }

        let (seed, profile) = (self.fingerprint.seed, self.fingerprint.profile.clone());
        fill_profile(&profile, seed, self.data_mut());
        self.stamp_tag();
        self.fills += 1;

        if let Backing::Mapped(m) = &self.backing {
            m.flush()?;
        }
        tracing::debug!(blob = %self.fingerprint, "filled dictionary");
        Ok(true)
    }

    /// Write the id + content tags. Exposed for the bootstrap receiver,
    /// which materializes the data region from the wire instead of filling.
    pub fn stamp_tag(&mut self) {
        let tag = self.fingerprint.content_tag();
        let header = &mut self.backing.bytes_mut()[..HEADER_LEN];
        header[..8].copy_from_slice(ID_TAG);
        header[8..].copy_from_slice(&tag);
    }

    /// Circular read from the data region.
    pub fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, BlobError> {
        CircularBuffer::new(self.data()).read(offset, len)
    }

    /// Bounded write into the data region. Used when materializing a blob
    /// from a bootstrap stream; the sync protocol itself never writes.
    pub fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<(), BlobError> {
        let size = self.fingerprint.size;
        if offset + bytes.len() as u64 > size {
            return Err(BlobError::ReadTooLong {
                len: offset + bytes.len() as u64,
                size,
            });
        }
        let start = offset as usize;
        self.data_mut()[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}
