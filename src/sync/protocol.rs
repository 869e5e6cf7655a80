//! Wire messages for the blueprint sync protocol.
//!
//! Frame format: `len:u32 | type:u8 | payload`, all integers big-endian.
//! High-frequency controls (`WIN`, `PAYLOAD`, `END`) use compact binary
//! payloads; the low-frequency ones (preface, manifest, need, done, ack)
//! are JSON with short, fixed field names (`idx`, `h`, `sha`, `tw`, `ws`).
//! Every frame is decoded into [`ControlMsg`] exactly once at the frame
//! boundary; nothing downstream re-parses bytes.

use anyhow::{Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (64MB) - prevents OOM from malicious/corrupted frames.
pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024;

/// Manifest hash algorithm label.
pub const ALGO_SHA256_16: &str = "sha256-16";

// =============================================================================
// Frame types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Preface = 0x01,
    Mfst = 0x02,
    Need = 0x03,
    Win = 0x04,
    Payload = 0x05,
    End = 0x06,
    Done = 0x07,
    Eoc = 0x08,
    Ack = 0x09,
    BlobStart = 0x0A,
}

impl FrameType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Preface),
            0x02 => Some(Self::Mfst),
            0x03 => Some(Self::Need),
            0x04 => Some(Self::Win),
            0x05 => Some(Self::Payload),
            0x06 => Some(Self::End),
            0x07 => Some(Self::Done),
            0x08 => Some(Self::Eoc),
            0x09 => Some(Self::Ack),
            0x0A => Some(Self::BlobStart),
            _ => None,
        }
    }
}

// =============================================================================
// JSON control payloads
// =============================================================================

/// First message on every channel of a transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preface {
    pub transfer_id: String,
    pub channels: u32,
    pub channel_id: u32,
    /// `name:size:seed[:profile]`
    pub blob_fingerprint: String,
    /// Hex SHA-256 of the whole object.
    pub object_sha256: String,
    pub anchor: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub psk: Option<String>,
}

/// Window-hash manifest, channel 0 only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub algo: String,
    /// Window size.
    pub ws: u32,
    /// Total windows.
    pub tw: u32,
    /// Exact object size; the last window may be short.
    pub size: u64,
    /// Hex hash16 per window, in index order.
    pub hashes: Vec<String>,
}

impl Manifest {
    pub fn hash16_at(&self, index: usize) -> Result<[u8; 16]> {
        let raw = hex::decode(
            self.hashes
                .get(index)
                .with_context(|| format!("manifest has no hash for window {index}"))?,
        )
        .context("manifest hash is not hex")?;
        let mut h = [0u8; 16];
        if raw.len() != 16 {
            anyhow::bail!("manifest hash for window {index} is {} bytes", raw.len());
        }
        h.copy_from_slice(&raw);
        Ok(h)
    }
}

/// Receiver's declaration of the window indices it still requires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Need {
    pub needed: Vec<u32>,
}

/// Sent by channel 0 after its own shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Done {
    /// Hex SHA-256 of the whole object.
    pub sha: String,
    pub tw: u32,
    pub ws: u32,
}

fn default_true() -> bool {
    true
}

/// Final per-channel acknowledgement from the receiver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    /// `"ok"` for non-zero channels, `"done"` for channel 0.
    pub status: String,
    #[serde(default = "default_true")]
    pub ok: bool,
    #[serde(default)]
    pub windows: u64,
    #[serde(default)]
    pub bytes: u64,
}

impl Ack {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
            ok: true,
            windows: 0,
            bytes: 0,
        }
    }
}

/// Opens a blob bootstrap stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobStart {
    /// `name:size:seed[:profile]`
    pub blob: String,
    pub tw: u32,
    pub ws: u32,
}

// =============================================================================
// ControlMsg
// =============================================================================

/// Every wire message, decoded once at the frame boundary.
#[derive(Debug, Clone)]
pub enum ControlMsg {
    Preface(Preface),
    Mfst(Manifest),
    Need(Need),
    /// Start of a window's payload frames.
    Win(u32),
    /// One chunk of a window's container payload; reassembled by
    /// concatenation in arrival order.
    Payload(Bytes),
    /// End of a window: index plus the hash16 of its plaintext.
    End { idx: u32, hash16: [u8; 16] },
    Done(Done),
    /// End-of-channel marker from non-zero channels (also the no-op an
    /// empty-bucket channel sends so the completion check is satisfiable).
    Eoc,
    Ack(Ack),
    BlobStart(BlobStart),
}

impl ControlMsg {
    pub fn frame_type(&self) -> FrameType {
        match self {
            ControlMsg::Preface(_) => FrameType::Preface,
            ControlMsg::Mfst(_) => FrameType::Mfst,
            ControlMsg::Need(_) => FrameType::Need,
            ControlMsg::Win(_) => FrameType::Win,
            ControlMsg::Payload(_) => FrameType::Payload,
            ControlMsg::End { .. } => FrameType::End,
            ControlMsg::Done(_) => FrameType::Done,
            ControlMsg::Eoc => FrameType::Eoc,
            ControlMsg::Ack(_) => FrameType::Ack,
            ControlMsg::BlobStart(_) => FrameType::BlobStart,
        }
    }

    /// Encode the full frame (header + payload).
    pub fn encode(&self) -> Result<Bytes> {
        let payload = match self {
            ControlMsg::Preface(m) => Bytes::from(serde_json::to_vec(m)?),
            ControlMsg::Mfst(m) => Bytes::from(serde_json::to_vec(m)?),
            ControlMsg::Need(m) => Bytes::from(serde_json::to_vec(m)?),
            ControlMsg::Win(idx) => {
                let mut buf = BytesMut::with_capacity(4);
                buf.put_u32(*idx);
                buf.freeze()
            }
            ControlMsg::Payload(data) => data.clone(),
            ControlMsg::End { idx, hash16 } => {
                let mut buf = BytesMut::with_capacity(20);
                buf.put_u32(*idx);
                buf.put_slice(hash16);
                buf.freeze()
            }
            ControlMsg::Done(m) => Bytes::from(serde_json::to_vec(m)?),
            ControlMsg::Eoc => Bytes::new(),
            ControlMsg::Ack(m) => Bytes::from(serde_json::to_vec(m)?),
            ControlMsg::BlobStart(m) => Bytes::from(serde_json::to_vec(m)?),
        };

        let mut frame = BytesMut::with_capacity(5 + payload.len());
        frame.put_u32(payload.len() as u32);
        frame.put_u8(self.frame_type() as u8);
        frame.put_slice(&payload);
        Ok(frame.freeze())
    }

    pub fn decode(frame_type: FrameType, mut payload: Bytes) -> Result<Self> {
        let msg = match frame_type {
            FrameType::Preface => {
                ControlMsg::Preface(serde_json::from_slice(&payload).context("bad preface")?)
            }
            FrameType::Mfst => {
                ControlMsg::Mfst(serde_json::from_slice(&payload).context("bad manifest")?)
            }
            FrameType::Need => {
                ControlMsg::Need(serde_json::from_slice(&payload).context("bad need")?)
            }
            FrameType::Win => {
                if payload.remaining() < 4 {
                    anyhow::bail!("WIN payload too short");
                }
                ControlMsg::Win(payload.get_u32())
            }
            FrameType::Payload => ControlMsg::Payload(payload),
            FrameType::End => {
                if payload.remaining() < 20 {
                    anyhow::bail!("END payload too short");
                }
                let idx = payload.get_u32();
                let mut hash16 = [0u8; 16];
                payload.copy_to_slice(&mut hash16);
                ControlMsg::End { idx, hash16 }
            }
            FrameType::Done => {
                ControlMsg::Done(serde_json::from_slice(&payload).context("bad done")?)
            }
            FrameType::Eoc => ControlMsg::Eoc,
            FrameType::Ack => ControlMsg::Ack(serde_json::from_slice(&payload).context("bad ack")?),
            FrameType::BlobStart => ControlMsg::BlobStart(
                serde_json::from_slice(&payload).context("bad blob start")?,
            ),
        };
        Ok(msg)
    }
}

// =============================================================================
// Frame reading/writing
// =============================================================================

/// Read and decode one message from the stream.
pub async fn read_msg<R: AsyncRead + Unpin>(r: &mut R) -> Result<ControlMsg> {
    let len = r.read_u32().await.context("failed to read frame length")?;
    if len > MAX_FRAME_SIZE {
        anyhow::bail!("frame size {} exceeds maximum {}", len, MAX_FRAME_SIZE);
    }

    let frame_type = r.read_u8().await.context("failed to read frame type")?;
    let frame_type = FrameType::from_u8(frame_type)
        .with_context(|| format!("unknown frame type {frame_type:#04x}"))?;

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)
        .await
        .context("failed to read frame payload")?;

    ControlMsg::decode(frame_type, Bytes::from(payload))
}

/// Encode and write one message.
pub async fn write_msg<W: AsyncWrite + Unpin>(w: &mut W, msg: &ControlMsg) -> Result<()> {
    let frame = msg.encode()?;
    w.write_all(&frame).await.context("failed to write frame")?;
    Ok(())
}

/// Whether a read error means the peer closed the connection cleanly.
///
/// A channel whose connection is closed immediately after completion is
/// treated as success, not failure.
pub fn is_clean_eof(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .map(|io| io.kind() == std::io::ErrorKind::UnexpectedEof)
            .unwrap_or(false)
    })
}

/// Constant-time byte comparison for the preface PSK gate.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}
