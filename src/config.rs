//! Tunable configuration for the sync protocol.
//!
//! The negotiation timeout and the bucket-wait bound are deliberately
//! configuration rather than constants; both were implicit timings in the
//! protocol's first implementation.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default per-frame payload bound (256KB).
pub const DEFAULT_FRAME_SIZE: usize = 256 * 1024;

/// Default bound on a manifest's declared object size (16GB).
pub const DEFAULT_MAX_OBJECT_SIZE: u64 = 16 * 1024 * 1024 * 1024;

/// What to do when a window's recomputed hash disagrees with the END hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyPolicy {
    /// Record the mismatch in the transfer outcome and log it, but let
    /// assembly proceed. This is the historical behavior.
    Record,
    /// Mark the whole transfer not-ok on any window mismatch.
    Fail,
}

impl Default for VerifyPolicy {
    fn default() -> Self {
        VerifyPolicy::Record
    }
}

/// Protocol tunables shared by sender and receiver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Upper bound on a single payload frame's data bytes.
    pub frame_size: usize,

    /// Upper bound on the object size a manifest may declare. A manifest
    /// exceeding it is a protocol error and closes the channel.
    pub max_object_size: u64,

    /// How long the sender waits for a NEED reply before defaulting to
    /// "all windows needed".
    pub need_timeout: Duration,

    /// Bound on every receive, on every channel.
    pub recv_timeout: Duration,

    /// How long a non-zero channel waits for channel 0 to publish buckets.
    pub bucket_wait_timeout: Duration,

    /// Sessions older than this are evicted from the registry even if some
    /// channel never reported.
    pub session_ttl: Duration,

    /// Window hash mismatch policy.
    pub verify: VerifyPolicy,

    /// Optional shared secret; when set, prefaces carrying a different value
    /// are rejected before any other frame is read.
    pub psk: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            frame_size: DEFAULT_FRAME_SIZE,
            max_object_size: DEFAULT_MAX_OBJECT_SIZE,
            need_timeout: Duration::from_secs(5),
            recv_timeout: Duration::from_secs(30),
            bucket_wait_timeout: Duration::from_secs(30),
            session_ttl: Duration::from_secs(300),
            verify: VerifyPolicy::default(),
            psk: None,
        }
    }
}
