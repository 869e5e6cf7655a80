//! The deterministic shared dictionary ("blob").
//!
//! Both endpoints of a transfer materialize the same byte buffer from a small
//! fingerprint, out of band. The sync protocol only ever reads it.

pub mod circular;
pub mod fingerprint;
pub mod generator;
pub mod store;

pub use circular::CircularBuffer;
pub use fingerprint::{Fingerprint, DEFAULT_PROFILE};
pub use generator::{fill_profile, XorShift32, PAGE};
pub use store::{Blob, HEADER_LEN};
