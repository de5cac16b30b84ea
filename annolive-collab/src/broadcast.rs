//! Room fan-out.
//!
//! Every room owns one tokio broadcast channel carrying pre-encoded JSON text
//! frames. A state change is serialized once and the same `Arc<str>` is
//! handed to every subscriber. Each subscriber buffers up to `capacity`
//! frames; a slower one lags without stalling the room, and its connection
//! closes so the client can resync from a snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::error::CollabError;
use crate::protocol::Outbound;

/// A single encoded text frame shared by all receivers.
pub type Frame = Arc<str>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub subscribers: usize,
}

#[derive(Debug)]
pub struct BroadcastGroup {
    sender: broadcast::Sender<Frame>,
    frames_sent: AtomicU64,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            frames_sent: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.sender.subscribe()
    }

    /// Serialize once and fan out. Returns the number of receivers reached.
    pub fn broadcast(&self, msg: &Outbound) -> Result<usize, CollabError> {
        let frame: Frame = msg.encode()?.into();
        Ok(self.broadcast_raw(frame))
    }

    /// Fan out an already encoded frame. No receivers is not an error.
    pub fn broadcast_raw(&self, frame: Frame) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }
}
