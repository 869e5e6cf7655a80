//! Typed errors for the codec and blob layers.
//!
//! The async protocol layers use `anyhow::Result` with context; the
//! byte-level decoders and the dictionary store return these typed errors so
//! callers can distinguish "bad wire data" from "bad environment".

use thiserror::Error;

/// Errors from container/record decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    /// A magic or section tag did not match any known value.
    #[error("bad magic: expected {expected:?}, got {got:?}")]
    BadMagic { expected: &'static str, got: [u8; 4] },

    /// Fewer bytes remained than a record or field requires.
    #[error("truncated {what}: need {need} bytes, {have} remaining")]
    Truncated {
        what: &'static str,
        need: usize,
        have: usize,
    },

    /// A BREF section whose length is not a whole number of records.
    #[error("reference section length {len} is not a multiple of {record} bytes")]
    RaggedSection { len: usize, record: usize },

    /// An unknown section tag inside a PVRT container.
    #[error("unknown section tag {got:?}")]
    UnknownSection { got: [u8; 4] },
}

/// Errors from blob creation, attachment, and reads.
#[derive(Debug, Error)]
pub enum BlobError {
    /// An existing shared buffer is smaller than the requested size.
    /// Fatal and non-retryable.
    #[error("existing buffer for {name:?} holds {existing} bytes, {requested} requested")]
    Capacity {
        name: String,
        existing: u64,
        requested: u64,
    },

    /// Attach requested without create, and no buffer exists.
    #[error("no buffer for {name:?} and create not requested")]
    NotFound { name: String },

    /// A read longer than the buffer itself.
    #[error("read of {len} bytes exceeds blob size {size}")]
    ReadTooLong { len: u64, size: u64 },

    /// Fingerprint string did not parse as `name:size:seed[:profile]`.
    #[error("malformed fingerprint {input:?}: {reason}")]
    BadFingerprint { input: String, reason: &'static str },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
