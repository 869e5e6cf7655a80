//! bsync: content-addressed delta synchronization over a shared derived
//! dictionary.
//!
//! Both sides of a transfer derive the same large pseudo-random dictionary
//! (the blob) from a short fingerprint; objects are then described as
//! reference lists into that shared dictionary and shipped as compact
//! window manifests over any number of parallel channels.
//!
//! The crate is organized bottom-up:
//!
//! - [`blob`]: deterministic dictionary generation, attachment, and reads
//! - [`container`]: reference records and the OFFS/PVRT wire containers
//! - [`iprog`]: compiling objects into window manifests
//! - [`sync`]: the multi-channel transfer protocol and blob bootstrap

pub mod blob;
pub mod config;
pub mod container;
pub mod error;
pub mod iprog;
pub mod logging;
pub mod sync;

pub use blob::{Blob, Fingerprint};
pub use config::{SyncConfig, VerifyPolicy};
pub use error::{BlobError, CodecError};
pub use iprog::IProg;
pub use sync::{BlueprintSender, SyncReceiver, TransferOutcome};
