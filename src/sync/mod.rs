//! The blueprint sync protocol: multi-channel window transfer plus the blob
//! bootstrap exchange.
//!
//! A transfer moves one compiled object program from sender to receiver over
//! N parallel channels. Channel 0 carries the negotiation (preface,
//! manifest, NEED, DONE); window shards flow on every channel; the receiver
//! assembles and verifies once all channels report.

pub mod bootstrap;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod session;

pub use bootstrap::{receive_blob, send_blob};
pub use protocol::{ControlMsg, FrameType, MAX_FRAME_SIZE};
pub use receiver::{
    MemoryWindowCache, NoCache, SyncReceiver, TransferOutcome, WindowCache, WindowMismatch,
};
pub use sender::{BlueprintSender, SendReport};
pub use session::{SessionRegistry, TransferSession};
