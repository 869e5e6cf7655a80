//! Reference container format.
//!
//! A window's content travels as a short list of `(offset, length, flags)`
//! references into the shared blob, packed into one of two interchangeable
//! containers: the minimal tagged-count `OFFS` list, or the multi-section
//! `PVRT` container which can also carry raw bytes and a legacy payload
//! section for windows that could not be expressed as references.

pub mod codec;
pub mod cursor;
pub mod reference;

pub use codec::{decode_offs, encode_offs, Container, OFFS_MAGIC, PVRT_MAGIC};
pub use cursor::Cursor;
pub use reference::{resolve_all, RefFlags, Reference, Transform, RECORD_LEN};
