//! Blob bootstrap: ship a whole dictionary to a peer that cannot generate
//! one locally.
//!
//! Reuses the window framing of the sync protocol over a single stream, but
//! the payloads are raw data-region bytes rather than reference containers.
//! The received blob is tagged only after the final digest checks out, so an
//! interrupted bootstrap is retried from scratch instead of being trusted.

use crate::blob::{Blob, Fingerprint};
use crate::config::SyncConfig;
use crate::iprog::hash16;
use crate::sync::protocol::{self, Ack, BlobStart, ControlMsg, Done};
use anyhow::{Context, Result};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Stream a filled blob's data region, window by window.
pub async fn send_blob<S>(
    blob: &Blob,
    window_size: u32,
    stream: &mut S,
    config: &SyncConfig,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    anyhow::ensure!(window_size > 0, "window size must be positive");
    anyhow::ensure!(blob.is_filled(), "refusing to bootstrap from an unfilled blob");

    let fp = blob.fingerprint();
    let size = fp.size;
    let tw = size.div_ceil(window_size as u64) as u32;

    protocol::write_msg(
        stream,
        &ControlMsg::BlobStart(BlobStart {
            blob: fp.to_string(),
            tw,
            ws: window_size,
        }),
    )
    .await?;

    let mut hasher = Sha256::new();
    for idx in 0..tw {
        let offset = idx as u64 * window_size as u64;
        let len = (size - offset).min(window_size as u64) as usize;
        let window = blob.read(offset, len)?;
        hasher.update(&window);

        protocol::write_msg(stream, &ControlMsg::Win(idx)).await?;
        for chunk in window.chunks(config.frame_size) {
            protocol::write_msg(stream, &ControlMsg::Payload(Bytes::copy_from_slice(chunk)))
                .await?;
        }
        protocol::write_msg(
            stream,
            &ControlMsg::End {
                idx,
                hash16: hash16(&window),
            },
        )
        .await?;
    }

    protocol::write_msg(
        stream,
        &ControlMsg::Done(Done {
            sha: hex::encode(hasher.finalize()),
            tw,
            ws: window_size,
        }),
    )
    .await?;
    stream.flush().await?;

    match timeout(config.recv_timeout, protocol::read_msg(stream)).await {
        Ok(Ok(ControlMsg::Ack(ack))) if ack.ok => {
            tracing::info!(blob = %fp, windows = tw, "bootstrap sent");
            Ok(())
        }
        Ok(Ok(ControlMsg::Ack(_))) => anyhow::bail!("peer rejected the bootstrapped blob"),
        Ok(Ok(other)) => anyhow::bail!("expected ack, got {other:?}"),
        Ok(Err(err)) => Err(err),
        Err(_) => anyhow::bail!("timed out waiting for bootstrap ack"),
    }
}

/// Receive a blob bootstrap into `dir`, verifying every window hash and the
/// whole-region digest before stamping the content tag.
pub async fn receive_blob<S>(stream: &mut S, dir: &Path, config: &SyncConfig) -> Result<Blob>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let start = match timeout(config.recv_timeout, protocol::read_msg(stream))
        .await
        .context("timed out waiting for blob start")??
    {
        ControlMsg::BlobStart(start) => start,
        other => anyhow::bail!("expected blob start, got {other:?}"),
    };

    let fp = Fingerprint::parse(&start.blob)?;
    let mut blob = Blob::create_or_attach(dir, &fp, true)?;
    let ws = start.ws as u64;

    let mut hasher = Sha256::new();
    let mut current: Option<(u32, Vec<u8>)> = None;
    loop {
        let msg = timeout(config.recv_timeout, protocol::read_msg(stream))
            .await
            .context("bootstrap receive timed out")??;
        match msg {
            ControlMsg::Win(idx) => current = Some((idx, Vec::new())),
            ControlMsg::Payload(data) => match &mut current {
                Some((_, buf)) => buf.extend_from_slice(&data),
                None => anyhow::bail!("payload before WIN in bootstrap"),
            },
            ControlMsg::End { idx, hash16: expected } => {
                let (open, window) = current
                    .take()
                    .context("END before WIN in bootstrap")?;
                anyhow::ensure!(open == idx, "END for window {idx} while {open} is open");
                let actual = hash16(&window);
                anyhow::ensure!(
                    actual == expected,
                    "bootstrap window {idx} hash mismatch"
                );
                hasher.update(&window);
                blob.write_at(idx as u64 * ws, &window)?;
            }
            ControlMsg::Done(done) => {
                let digest = hex::encode(hasher.finalize());
                anyhow::ensure!(
                    digest == done.sha,
                    "bootstrap digest mismatch: expected {}, got {digest}",
                    done.sha
                );
                blob.stamp_tag();
                protocol::write_msg(stream, &ControlMsg::Ack(Ack::ok())).await?;
                stream.flush().await?;
                tracing::info!(blob = %blob.fingerprint(), windows = done.tw, "bootstrap received");
                return Ok(blob);
            }
            other => anyhow::bail!("unexpected {other:?} during bootstrap"),
        }
    }
}
