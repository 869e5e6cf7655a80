//! Receiver side of the blueprint sync protocol.
//!
//! Each connection is one channel of some transfer; handlers buffer the
//! decoded events into the shared session and the channel-0 handler
//! assembles once every channel has reported. Assembly walks each channel's
//! event log in order, attaching payload chunks to the most recent `WIN` on
//! that channel, so interleaving across channels cannot scramble windows.

use crate::blob::Blob;
use crate::config::{SyncConfig, VerifyPolicy};
use crate::container::{decode_offs, Container};
use crate::iprog::hash16;
use crate::sync::protocol::{
    self, Ack, ControlMsg, Done, Manifest, Need,
};
use crate::sync::session::{ChannelEvent, SessionRegistry, SharedSession};
use anyhow::{Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::time::timeout;

// =============================================================================
// Window cache seam
// =============================================================================

/// Lookup of locally held window plaintext by hash16.
///
/// Whatever the cache returns for a hash is trusted as that window's bytes;
/// windows it can serve are left out of the NEED reply and filled in from
/// the cache at assembly time.
pub trait WindowCache: Send + Sync {
    fn lookup(&self, hash16: &[u8; 16]) -> Option<Bytes>;
}

/// Cache that holds nothing; every window is needed.
pub struct NoCache;

impl WindowCache for NoCache {
    fn lookup(&self, _hash16: &[u8; 16]) -> Option<Bytes> {
        None
    }
}

/// In-memory cache keyed by hash16, mainly for pre-seeding known windows.
#[derive(Default)]
pub struct MemoryWindowCache {
    entries: std::sync::Mutex<HashMap<[u8; 16], Bytes>>,
}

impl MemoryWindowCache {
    pub fn insert(&self, plaintext: &[u8]) {
        self.entries
            .lock()
            .expect("window cache lock poisoned")
            .insert(hash16(plaintext), Bytes::copy_from_slice(plaintext));
    }
}

impl WindowCache for MemoryWindowCache {
    fn lookup(&self, hash16: &[u8; 16]) -> Option<Bytes> {
        self.entries
            .lock()
            .expect("window cache lock poisoned")
            .get(hash16)
            .cloned()
    }
}

// =============================================================================
// Transfer outcome
// =============================================================================

/// One window whose recomputed hash disagreed with the sender's END hash.
#[derive(Debug, Clone)]
pub struct WindowMismatch {
    pub index: u32,
    pub expected: [u8; 16],
    pub actual: [u8; 16],
}

/// Receiver-side result of a completed transfer, retrievable by transfer id.
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub transfer_id: String,
    pub ok: bool,
    /// Whole-object SHA-256 matched the sender's DONE digest.
    pub sha_match: bool,
    pub windows_received: u64,
    pub bytes_received: u64,
    /// Windows neither transferred nor found in the cache.
    pub missing: Vec<u32>,
    pub mismatches: Vec<WindowMismatch>,
    /// The assembled object, truncated to the manifest's declared size.
    pub data: Bytes,
}

// =============================================================================
// Receiver
// =============================================================================

pub struct SyncReceiver {
    config: SyncConfig,
    blob: Arc<Blob>,
    cache: Arc<dyn WindowCache>,
    registry: SessionRegistry,
    outcomes: Mutex<HashMap<String, (Instant, TransferOutcome)>>,
}

impl SyncReceiver {
    pub fn new(config: SyncConfig, blob: Arc<Blob>, cache: Arc<dyn WindowCache>) -> Self {
        let registry = SessionRegistry::new(config.session_ttl);
        Self {
            config,
            blob,
            cache,
            registry,
            outcomes: Mutex::new(HashMap::new()),
        }
    }

    /// Retrieve (and consume) the outcome of a completed transfer.
    pub async fn take_outcome(&self, transfer_id: &str) -> Option<TransferOutcome> {
        self.outcomes
            .lock()
            .await
            .remove(transfer_id)
            .map(|(_, outcome)| outcome)
    }

    /// Accept loop: every connection is one channel of some transfer.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await.context("accept failed")?;
            tracing::debug!(%peer, "channel connected");
            let receiver = self.clone();
            tokio::spawn(async move {
                if let Err(err) = receiver.handle_channel(stream).await {
                    tracing::warn!(%peer, error = %err, "channel handler failed");
                }
            });
        }
    }

    /// Drive one channel from preface to ack.
    pub async fn handle_channel<S>(&self, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let preface = match self.read_frame(&mut stream).await? {
            ControlMsg::Preface(p) => p,
            other => anyhow::bail!("expected preface, got {other:?}"),
        };

        // PSK gate: checked before anything else is read, constant-time.
        if let Some(expected) = &self.config.psk {
            let presented = preface.psk.as_deref().unwrap_or("");
            if !protocol::constant_time_eq(expected.as_bytes(), presented.as_bytes()) {
                tracing::warn!(transfer_id = %preface.transfer_id, "psk rejected");
                anyhow::bail!("psk mismatch");
            }
        }

        let channel_id = preface.channel_id;
        let session = self.registry.get_or_create(&preface).await?;

        // A channel that dies without DONE/EOC must still unblock the
        // completion barrier, so it reports on every exit path.
        let result = self
            .channel_loop(&mut stream, &session, channel_id)
            .await;
        session.lock().await.mark_reported(channel_id);
        result?;

        if channel_id != 0 {
            let ack = ControlMsg::Ack(Ack::ok());
            protocol::write_msg(&mut stream, &ack).await?;
            stream.flush().await?;
            return Ok(());
        }

        self.finish_transfer(&mut stream, &preface.transfer_id, session)
            .await
    }

    /// Buffer this channel's events until DONE, EOC, or a clean close.
    async fn channel_loop<S>(
        &self,
        stream: &mut S,
        session: &SharedSession,
        channel_id: u32,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let msg = match self.read_frame(stream).await {
                Ok(msg) => msg,
                Err(err) if protocol::is_clean_eof(&err) => {
                    tracing::debug!(channel_id, "channel closed without a trailer");
                    return Ok(());
                }
                Err(err) => return Err(err),
            };

            match msg {
                ControlMsg::Mfst(manifest) => {
                    if manifest.size > self.config.max_object_size {
                        anyhow::bail!(
                            "manifest declares {} bytes, above the {} byte bound",
                            manifest.size,
                            self.config.max_object_size
                        );
                    }
                    let needed = self.compute_need(&manifest);
                    session.lock().await.manifest = Some(manifest);
                    protocol::write_msg(stream, &ControlMsg::Need(Need { needed })).await?;
                    stream.flush().await?;
                }
                ControlMsg::Win(idx) => {
                    session
                        .lock()
                        .await
                        .record_event(channel_id, ChannelEvent::Win(idx));
                }
                ControlMsg::Payload(data) => {
                    session
                        .lock()
                        .await
                        .record_event(channel_id, ChannelEvent::Payload(data));
                }
                ControlMsg::End { idx, hash16 } => {
                    session
                        .lock()
                        .await
                        .record_event(channel_id, ChannelEvent::End { idx, hash16 });
                }
                ControlMsg::Done(done) => {
                    session.lock().await.done = Some(done);
                    return Ok(());
                }
                ControlMsg::Eoc => return Ok(()),
                other => anyhow::bail!("unexpected {other:?} on channel {channel_id}"),
            }
        }
    }

    /// Channel 0 epilogue: wait for every channel, assemble, ack.
    async fn finish_transfer<S>(
        &self,
        stream: &mut S,
        transfer_id: &str,
        session: SharedSession,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.wait_all_reported(&session).await?;

        self.registry.remove(transfer_id).await;
        let outcome = {
            let guard = session.lock().await;
            let manifest = guard
                .manifest
                .as_ref()
                .context("transfer finished without a manifest")?;
            let done = guard
                .done
                .as_ref()
                .context("transfer finished without DONE")?;
            assemble(
                transfer_id,
                manifest,
                done,
                &guard.events,
                &self.blob,
                guard.anchor,
                self.cache.as_ref(),
                self.config.verify,
            )
        };

        let ack = ControlMsg::Ack(Ack {
            status: "done".to_string(),
            ok: outcome.ok,
            windows: outcome.windows_received,
            bytes: outcome.bytes_received,
        });
        tracing::info!(
            transfer_id,
            ok = outcome.ok,
            sha_match = outcome.sha_match,
            windows = outcome.windows_received,
            bytes = outcome.bytes_received,
            "transfer assembled"
        );
        self.store_outcome(outcome).await;

        protocol::write_msg(stream, &ack).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Block until every channel of the transfer has reported.
    ///
    /// The wait is refreshed by each new report; only a stretch of
    /// `recv_timeout` with no channel reporting at all times out.
    async fn wait_all_reported(&self, session: &SharedSession) -> Result<()> {
        let mut reported_rx = session.lock().await.subscribe_reported();
        while !session.lock().await.all_reported() {
            timeout(self.config.recv_timeout, reported_rx.changed())
                .await
                .context("timed out waiting for sibling channels")?
                .context("session dropped while waiting for channels")?;
        }
        Ok(())
    }

    /// Retain outcomes for at most the session TTL; unconsumed transfers
    /// must not pin their assembled objects forever.
    async fn store_outcome(&self, outcome: TransferOutcome) {
        let ttl = self.config.session_ttl;
        let mut outcomes = self.outcomes.lock().await;
        outcomes.retain(|_, (stored, _)| stored.elapsed() <= ttl);
        outcomes.insert(
            outcome.transfer_id.clone(),
            (Instant::now(), outcome),
        );
    }

    /// Windows the cache cannot serve are needed, in index order.
    fn compute_need(&self, manifest: &Manifest) -> Vec<u32> {
        (0..manifest.tw)
            .filter(|&idx| {
                manifest
                    .hash16_at(idx as usize)
                    .map(|h| self.cache.lookup(&h).is_none())
                    .unwrap_or(true)
            })
            .collect()
    }

    async fn read_frame<S>(&self, stream: &mut S) -> Result<ControlMsg>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match timeout(self.config.recv_timeout, protocol::read_msg(stream)).await {
            Ok(result) => result,
            Err(_) => anyhow::bail!("receive timed out"),
        }
    }
}

// =============================================================================
// Assembly
// =============================================================================

/// Rebuild the object from the buffered channel events.
#[allow(clippy::too_many_arguments)]
fn assemble(
    transfer_id: &str,
    manifest: &Manifest,
    done: &Done,
    events: &HashMap<u32, Vec<ChannelEvent>>,
    blob: &Blob,
    anchor: u64,
    cache: &dyn WindowCache,
    verify: VerifyPolicy,
) -> TransferOutcome {
    // Group payloads under the most recent WIN of their own channel.
    let mut transferred: HashMap<u32, (Bytes, [u8; 16])> = HashMap::new();
    for channel_events in events.values() {
        let mut current: Option<(u32, BytesMut)> = None;
        for event in channel_events {
            match event {
                ChannelEvent::Win(idx) => current = Some((*idx, BytesMut::new())),
                ChannelEvent::Payload(data) => match &mut current {
                    Some((_, buf)) => buf.put_slice(data),
                    None => tracing::warn!(transfer_id, "payload outside a window, dropped"),
                },
                ChannelEvent::End { idx, hash16 } => match current.take() {
                    Some((open, buf)) if open == *idx => {
                        transferred.insert(*idx, (buf.freeze(), *hash16));
                    }
                    _ => tracing::warn!(transfer_id, idx, "END without a matching WIN"),
                },
            }
        }
    }

    // Capacity comes from bytes actually received; the declared size is
    // wire input and only bounds the final truncation.
    let received: usize = transferred.values().map(|(p, _)| p.len()).sum();
    let mut assembled = Vec::with_capacity(received.min(manifest.size as usize));
    let mut outcome = TransferOutcome {
        transfer_id: transfer_id.to_string(),
        ok: true,
        sha_match: false,
        windows_received: 0,
        bytes_received: 0,
        missing: Vec::new(),
        mismatches: Vec::new(),
        data: Bytes::new(),
    };

    for idx in 0..done.tw {
        if let Some((payload, expected)) = transferred.get(&idx) {
            outcome.windows_received += 1;
            outcome.bytes_received += payload.len() as u64;

            let plaintext = match materialize_window(payload, blob, anchor) {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::warn!(transfer_id, idx, error = %err, "window unusable");
                    outcome.ok = false;
                    outcome.missing.push(idx);
                    continue;
                }
            };

            let actual = hash16(&plaintext);
            if actual != *expected {
                tracing::warn!(
                    transfer_id,
                    idx,
                    expected = %hex::encode(expected),
                    actual = %hex::encode(actual),
                    "window hash mismatch"
                );
                outcome.mismatches.push(WindowMismatch {
                    index: idx,
                    expected: *expected,
                    actual,
                });
                if verify == VerifyPolicy::Fail {
                    outcome.ok = false;
                }
            }
            assembled.extend_from_slice(&plaintext);
        } else {
            // Not on the wire: the NEED reply promised the cache has it.
            let cached = manifest
                .hash16_at(idx as usize)
                .ok()
                .and_then(|h| cache.lookup(&h));
            match cached {
                Some(bytes) => assembled.extend_from_slice(&bytes),
                None => {
                    tracing::warn!(transfer_id, idx, "window neither transferred nor cached");
                    outcome.ok = false;
                    outcome.missing.push(idx);
                }
            }
        }
    }

    assembled.truncate(manifest.size as usize);
    let digest = hex::encode(Sha256::digest(&assembled));
    outcome.sha_match = digest == done.sha;
    if !outcome.sha_match {
        tracing::warn!(transfer_id, expected = %done.sha, actual = %digest, "object sha mismatch");
        outcome.ok = false;
    }
    outcome.data = Bytes::from(assembled);
    outcome
}

/// Decode a window payload in either container form and resolve it.
fn materialize_window(payload: &Bytes, blob: &Blob, anchor: u64) -> Result<Vec<u8>> {
    match Container::decode(payload.clone()) {
        Ok(container) => container.materialize(blob, anchor),
        Err(_) => {
            let refs = decode_offs(payload.clone()).context("payload is neither PVRT nor OFFS")?;
            Container::from_refs(refs).materialize(blob, anchor)
        }
    }
}
