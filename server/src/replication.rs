//! Cross-process edit replication over a pub/sub channel.
//!
//! Every server process publishes its locally-accepted edits exactly once on
//! a shared topic and applies what it hears from peers straight to its own
//! board. The envelope is a type discriminator plus the base64-encoded
//! wire-codec bytes, nothing else; suppressing a process's own deliveries is
//! the channel layer's job (each bus handle carries an origin tag, the way a
//! broker connection identity would). Replication is best effort: publish
//! failures are logged and never fail or delay the local edit, and there is
//! no ordering across publishers, so concurrent conflicting edits converge
//! to whichever delivery lands last.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::warn;
use serde::{Deserialize, Serialize};
use shared::{codec, PixelEdit};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("replication channel closed")]
    ChannelClosed,
}

/// Envelope carried on the replication topic.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ReplMessage {
    Point { payload: String },
    Batch { payload: String },
}

/// One decoded inbound delivery.
#[derive(Debug, PartialEq, Eq)]
pub enum RemoteEdit {
    Point(PixelEdit),
    Batch(Vec<PixelEdit>),
}

/// In-process pub/sub topic standing in for an external broker. Handles
/// cloned from the same bus see each other's publications but never their
/// own.
#[derive(Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<BusFrame>,
    next_origin: Arc<AtomicU64>,
}

#[derive(Debug, Clone)]
struct BusFrame {
    origin: u64,
    body: String,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            next_origin: Arc::new(AtomicU64::new(1)),
        }
    }

    /// A publisher/subscriber endpoint with its own origin identity.
    pub fn handle(&self) -> BusHandle {
        BusHandle {
            origin: self.next_origin.fetch_add(1, Ordering::Relaxed),
            tx: self.tx.clone(),
        }
    }
}

pub struct BusHandle {
    origin: u64,
    tx: broadcast::Sender<BusFrame>,
}

impl BusHandle {
    pub fn publish(&self, body: String) -> Result<(), ReplicationError> {
        self.tx
            .send(BusFrame {
                origin: self.origin,
                body,
            })
            .map(|_| ())
            .map_err(|_| ReplicationError::ChannelClosed)
    }

    pub fn subscribe(&self) -> BusSubscription {
        BusSubscription {
            origin: self.origin,
            rx: self.tx.subscribe(),
        }
    }
}

pub struct BusSubscription {
    origin: u64,
    rx: broadcast::Receiver<BusFrame>,
}

impl BusSubscription {
    /// Next delivery from a peer; this handle's own publications are
    /// skipped. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<String> {
        loop {
            match self.rx.recv().await {
                Ok(frame) if frame.origin == self.origin => continue,
                Ok(frame) => return Some(frame.body),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Replication subscriber lagged, {} deliveries lost", missed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Outbound half of replication. Owned by the edit-accepting path only; the
/// inbound apply path never sees it, so received edits cannot loop back out.
pub struct ReplicationBridge {
    handle: BusHandle,
}

impl ReplicationBridge {
    pub fn new(handle: BusHandle) -> Self {
        Self { handle }
    }

    pub fn subscribe(&self) -> BusSubscription {
        self.handle.subscribe()
    }

    /// Best effort: a failed publish degrades convergence, never the edit.
    pub fn publish_point(&self, edit: &PixelEdit) {
        self.send(&ReplMessage::Point {
            payload: BASE64.encode(codec::encode_edit(edit)),
        });
    }

    pub fn publish_batch(&self, edits: &[PixelEdit]) {
        if edits.is_empty() {
            return;
        }
        self.send(&ReplMessage::Batch {
            payload: BASE64.encode(codec::encode_batch(edits)),
        });
    }

    fn send(&self, message: &ReplMessage) {
        match serde_json::to_string(message) {
            Ok(body) => {
                if let Err(e) = self.handle.publish(body) {
                    warn!("Replication publish failed: {}", e);
                }
            }
            Err(e) => warn!("Failed to encode replication message: {}", e),
        }
    }
}

/// Decodes one delivery; malformed messages yield `None` and get dropped by
/// the caller.
pub fn decode_message(body: &str) -> Option<RemoteEdit> {
    match serde_json::from_str::<ReplMessage>(body).ok()? {
        ReplMessage::Point { payload } => {
            let bytes = BASE64.decode(payload).ok()?;
            codec::decode_edit(&bytes).ok().map(RemoteEdit::Point)
        }
        ReplMessage::Batch { payload } => {
            let bytes = BASE64.decode(payload).ok()?;
            codec::decode_batch(&bytes).ok().map(RemoteEdit::Batch)
        }
    }
}
