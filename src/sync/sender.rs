//! Multi-channel blueprint sender.
//!
//! The caller opens N connections to the receiver and hands them over; all
//! negotiation happens on channel 0 (manifest out, NEED back, bucket split),
//! and the window shards stream concurrently on every channel. Channels
//! learn their buckets through a watch channel, so a bucket published before
//! a channel task gets around to looking is still seen.

use crate::blob::Fingerprint;
use crate::config::SyncConfig;
use crate::iprog::IProg;
use crate::sync::protocol::{
    self, Ack, ControlMsg, Done, Manifest, Need, Preface, ALGO_SHA256_16,
};
use anyhow::{Context, Result};
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::timeout;

/// What one run of the sender accomplished.
#[derive(Debug, Clone)]
pub struct SendReport {
    /// All channels completed and the receiver acknowledged assembly as ok.
    pub ok: bool,
    pub windows_sent: u64,
    pub bytes_sent: u64,
    /// Receiver-side counts from the final `done` ack, when one arrived.
    pub receiver_windows: u64,
    pub receiver_bytes: u64,
}

/// Per-window wire material, computed once and shared by all channel tasks.
struct PreparedWindow {
    hash16: [u8; 16],
    container: Bytes,
}

struct Shared {
    transfer_id: String,
    channels: u32,
    blob_fingerprint: String,
    object_sha256: String,
    anchor: u64,
    manifest: Manifest,
    windows: Vec<PreparedWindow>,
    config: SyncConfig,
}

/// Outcome of one channel task.
struct ChannelReport {
    windows_sent: u64,
    bytes_sent: u64,
    ack: Option<Ack>,
}

pub struct BlueprintSender {
    config: SyncConfig,
    anchor: u64,
}

impl BlueprintSender {
    pub fn new(config: SyncConfig, anchor: u64) -> Self {
        Self { config, anchor }
    }

    /// Run one transfer over a set of pre-opened channels.
    ///
    /// `streams[0]` becomes channel 0 and carries the negotiation; the rest
    /// only stream their shard. Returns once every channel has finished and
    /// been acknowledged (or cleanly closed).
    pub async fn run<S>(
        &self,
        iprog: &IProg,
        fingerprint: &Fingerprint,
        transfer_id: &str,
        streams: Vec<S>,
    ) -> Result<SendReport>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        anyhow::ensure!(!streams.is_empty(), "sender needs at least one channel");
        let channels = streams.len() as u32;

        let windows: Vec<PreparedWindow> = iprog
            .windows
            .iter()
            .map(|w| PreparedWindow {
                hash16: w.hash16,
                container: w.container().encode(),
            })
            .collect();

        let manifest = Manifest {
            algo: ALGO_SHA256_16.to_string(),
            ws: iprog.window_size,
            tw: iprog.total_windows(),
            size: iprog.size,
            hashes: iprog.windows.iter().map(|w| hex::encode(w.hash16)).collect(),
        };

        let shared = Arc::new(Shared {
            transfer_id: transfer_id.to_string(),
            channels,
            blob_fingerprint: fingerprint.to_string(),
            object_sha256: iprog.sha_hex(),
            anchor: self.anchor,
            manifest,
            windows,
            config: self.config.clone(),
        });

        // Channel 0 publishes the bucket split here once NEED (or its
        // timeout) resolves; every channel waits on its own receiver.
        let (bucket_tx, bucket_rx) = watch::channel::<Option<Arc<Vec<Vec<u32>>>>>(None);

        let mut tasks = Vec::with_capacity(streams.len());
        for (channel_id, stream) in streams.into_iter().enumerate() {
            let shared = shared.clone();
            let bucket_tx = bucket_tx.clone();
            let bucket_rx = bucket_rx.clone();
            tasks.push(tokio::spawn(async move {
                run_channel(channel_id as u32, stream, shared, bucket_tx, bucket_rx).await
            }));
        }
        drop(bucket_tx);

        let mut report = SendReport {
            ok: true,
            windows_sent: 0,
            bytes_sent: 0,
            receiver_windows: 0,
            receiver_bytes: 0,
        };
        for task in futures::future::join_all(tasks).await {
            let channel = task.context("channel task panicked")??;
            report.windows_sent += channel.windows_sent;
            report.bytes_sent += channel.bytes_sent;
            if let Some(ack) = channel.ack {
                if ack.status == "done" {
                    report.ok &= ack.ok;
                    report.receiver_windows = ack.windows;
                    report.receiver_bytes = ack.bytes;
                }
            }
        }

        tracing::info!(
            transfer_id,
            ok = report.ok,
            windows = report.windows_sent,
            bytes = report.bytes_sent,
            "transfer finished"
        );
        Ok(report)
    }
}

async fn run_channel<S>(
    channel_id: u32,
    mut stream: S,
    shared: Arc<Shared>,
    bucket_tx: watch::Sender<Option<Arc<Vec<Vec<u32>>>>>,
    mut bucket_rx: watch::Receiver<Option<Arc<Vec<Vec<u32>>>>>,
) -> Result<ChannelReport>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let preface = Preface {
        transfer_id: shared.transfer_id.clone(),
        channels: shared.channels,
        channel_id,
        blob_fingerprint: shared.blob_fingerprint.clone(),
        object_sha256: shared.object_sha256.clone(),
        anchor: shared.anchor,
        psk: shared.config.psk.clone(),
    };
    protocol::write_msg(&mut stream, &ControlMsg::Preface(preface)).await?;

    if channel_id == 0 {
        protocol::write_msg(&mut stream, &ControlMsg::Mfst(shared.manifest.clone())).await?;
        stream.flush().await?;

        let needed = negotiate_need(&mut stream, &shared).await;
        let buckets = split_buckets(&needed, shared.channels);
        let _ = bucket_tx.send(Some(Arc::new(buckets)));
    }

    // Wait for the bucket split. watch keeps the latest value, so a bucket
    // published before this channel subscribes is not lost.
    let buckets = loop {
        let current = bucket_rx.borrow().clone();
        if let Some(b) = current {
            break b;
        }
        timeout(shared.config.bucket_wait_timeout, bucket_rx.changed())
            .await
            .context("timed out waiting for the bucket split")?
            .context("bucket publisher went away")?;
    };
    let bucket = &buckets[channel_id as usize];

    let mut bytes_sent = 0u64;
    for &idx in bucket {
        let window = shared
            .windows
            .get(idx as usize)
            .with_context(|| format!("receiver asked for nonexistent window {idx}"))?;

        protocol::write_msg(&mut stream, &ControlMsg::Win(idx)).await?;
        for chunk in window.container.chunks(shared.config.frame_size) {
            protocol::write_msg(
                &mut stream,
                &ControlMsg::Payload(Bytes::copy_from_slice(chunk)),
            )
            .await?;
            bytes_sent += chunk.len() as u64;
        }
        protocol::write_msg(
            &mut stream,
            &ControlMsg::End {
                idx,
                hash16: window.hash16,
            },
        )
        .await?;
    }

    let closing = if channel_id == 0 {
        ControlMsg::Done(Done {
            sha: shared.object_sha256.clone(),
            tw: shared.manifest.tw,
            ws: shared.manifest.ws,
        })
    } else {
        ControlMsg::Eoc
    };
    protocol::write_msg(&mut stream, &closing).await?;
    stream.flush().await?;

    // Final ack. A connection closed cleanly after completion also counts.
    let ack = match timeout(shared.config.recv_timeout, protocol::read_msg(&mut stream)).await {
        Ok(Ok(ControlMsg::Ack(ack))) => Some(ack),
        Ok(Ok(other)) => {
            anyhow::bail!("expected ack on channel {channel_id}, got {other:?}")
        }
        Ok(Err(err)) if protocol::is_clean_eof(&err) => None,
        Ok(Err(err)) => return Err(err),
        Err(_) => anyhow::bail!("timed out waiting for ack on channel {channel_id}"),
    };

    tracing::debug!(
        transfer_id = %shared.transfer_id,
        channel_id,
        windows = bucket.len(),
        bytes = bytes_sent,
        "channel shard complete"
    );
    Ok(ChannelReport {
        windows_sent: bucket.len() as u64,
        bytes_sent,
        ack,
    })
}

/// Wait for the receiver's NEED. No reply within the timeout means every
/// window is needed; the transfer degrades to a full send instead of
/// stalling.
async fn negotiate_need<S>(stream: &mut S, shared: &Shared) -> Vec<u32>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match timeout(shared.config.need_timeout, protocol::read_msg(stream)).await {
        Ok(Ok(ControlMsg::Need(Need { needed }))) => {
            tracing::debug!(
                transfer_id = %shared.transfer_id,
                needed = needed.len(),
                total = shared.manifest.tw,
                "receiver narrowed the window set"
            );
            needed
        }
        Ok(other) => {
            tracing::warn!(
                transfer_id = %shared.transfer_id,
                "unusable NEED reply ({other:?}), sending all windows"
            );
            (0..shared.manifest.tw).collect()
        }
        Err(_) => {
            tracing::debug!(
                transfer_id = %shared.transfer_id,
                "no NEED within the timeout, sending all windows"
            );
            (0..shared.manifest.tw).collect()
        }
    }
}

/// Round-robin the needed indices across the channels: the k-th needed
/// window goes to channel `k % channels`.
fn split_buckets(needed: &[u32], channels: u32) -> Vec<Vec<u32>> {
    let mut buckets = vec![Vec::new(); channels as usize];
    for (k, &idx) in needed.iter().enumerate() {
        buckets[k % channels as usize].push(idx);
    }
    buckets
}
