//! Transfer session state shared across a transfer's channels.
//!
//! Every channel of a transfer lands in its own handler task; the session
//! is the one place their observations meet. Channel 0 assembles only after
//! every expected channel has reported in, signalled through a watch so the
//! completion check cannot be missed.

use crate::sync::protocol::{Done, Manifest, Preface};
use anyhow::Result;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};

/// One decoded event observed on a channel, kept in arrival order.
///
/// Payload chunks belong to the most recent `Win` on the same channel;
/// ordering within a channel is what makes reassembly possible.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Win(u32),
    Payload(Bytes),
    End { idx: u32, hash16: [u8; 16] },
}

/// Shared state for one in-flight transfer.
pub struct TransferSession {
    pub transfer_id: String,
    pub channels: u32,
    pub anchor: u64,
    pub blob_fingerprint: String,
    pub created: Instant,
    pub manifest: Option<Manifest>,
    pub done: Option<Done>,
    /// Per-channel event logs, in arrival order.
    pub events: HashMap<u32, Vec<ChannelEvent>>,
    reported: HashSet<u32>,
    reported_tx: watch::Sender<u32>,
}

impl TransferSession {
    fn new(preface: &Preface) -> Self {
        let (reported_tx, _) = watch::channel(0);
        Self {
            transfer_id: preface.transfer_id.clone(),
            channels: preface.channels,
            anchor: preface.anchor,
            blob_fingerprint: preface.blob_fingerprint.clone(),
            created: Instant::now(),
            manifest: None,
            done: None,
            events: HashMap::new(),
            reported: HashSet::new(),
            reported_tx,
        }
    }

    pub fn record_event(&mut self, channel_id: u32, event: ChannelEvent) {
        self.events.entry(channel_id).or_default().push(event);
    }

    /// Mark a channel as finished. Idempotent; a channel that sends EOC and
    /// then closes counts once.
    pub fn mark_reported(&mut self, channel_id: u32) {
        if self.reported.insert(channel_id) {
            let _ = self.reported_tx.send(self.reported.len() as u32);
        }
    }

    pub fn all_reported(&self) -> bool {
        self.reported.len() as u32 >= self.channels
    }

    /// Subscribe to the reported-channel count. Watch semantics make the
    /// final report observable even if it lands before the subscriber looks.
    pub fn subscribe_reported(&self) -> watch::Receiver<u32> {
        self.reported_tx.subscribe()
    }
}

pub type SharedSession = Arc<Mutex<TransferSession>>;

/// Registry of in-flight transfers, keyed by transfer id.
///
/// Sessions are evicted lazily: any lookup first drops sessions older than
/// the TTL, so an abandoned transfer cannot pin its state forever.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SharedSession>>,
    ttl: Duration,
}

impl SessionRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Look up the session for a preface, creating it on first contact.
    ///
    /// Rejects a preface whose channel count disagrees with the session
    /// created by an earlier channel of the same transfer.
    pub async fn get_or_create(&self, preface: &Preface) -> Result<SharedSession> {
        if preface.channel_id >= preface.channels {
            anyhow::bail!(
                "transfer {} channel id {} out of range for {} channels",
                preface.transfer_id,
                preface.channel_id,
                preface.channels
            );
        }

        let mut sessions = self.sessions.lock().await;
        Self::evict_stale(&mut sessions, self.ttl).await;

        if let Some(existing) = sessions.get(&preface.transfer_id) {
            let session = existing.clone();
            let guard = session.lock().await;
            if guard.channels != preface.channels {
                anyhow::bail!(
                    "transfer {} channel count mismatch: session has {}, preface says {}",
                    preface.transfer_id,
                    guard.channels,
                    preface.channels
                );
            }
            drop(guard);
            return Ok(session);
        }

        let session = Arc::new(Mutex::new(TransferSession::new(preface)));
        sessions.insert(preface.transfer_id.clone(), session.clone());
        tracing::debug!(
            transfer_id = %preface.transfer_id,
            channels = preface.channels,
            "session created"
        );
        Ok(session)
    }

    /// Remove a completed transfer, returning its session for assembly.
    pub async fn remove(&self, transfer_id: &str) -> Option<SharedSession> {
        self.sessions.lock().await.remove(transfer_id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    async fn evict_stale(sessions: &mut HashMap<String, SharedSession>, ttl: Duration) {
        let mut stale = Vec::new();
        for (id, session) in sessions.iter() {
            if session.lock().await.created.elapsed() > ttl {
                stale.push(id.clone());
            }
        }
        for id in stale {
            sessions.remove(&id);
            tracing::warn!(transfer_id = %id, "evicted stale session");
        }
    }
}
