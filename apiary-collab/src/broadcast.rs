//! Fan-out of encoded event frames with per-connection audience filtering.
//!
//! One tokio broadcast channel carries every outbound frame. Each connection
//! holds its own receiver and drops deliveries whose [`Audience`] does not
//! include it, so a frame is encoded once no matter how many peers see it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use apiary_core::ActorId;
use tokio::sync::broadcast;

use crate::protocol::{Frame, ProtocolError};

/// Who an event is delivered to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    Everyone,
    EveryoneBut(ActorId),
    Actors(Vec<ActorId>),
    Only(ActorId),
}

impl Audience {
    pub fn includes(&self, actor: &str) -> bool {
        match self {
            Audience::Everyone => true,
            Audience::EveryoneBut(excluded) => excluded != actor,
            Audience::Actors(actors) => actors.iter().any(|a| a == actor),
            Audience::Only(target) => target == actor,
        }
    }
}

/// An encoded frame plus the connections that should receive it.
#[derive(Debug)]
pub struct Delivery {
    pub audience: Audience,
    pub bytes: Vec<u8>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub subscribers: usize,
}

/// Lock-free counters read via [`BroadcastGroup::stats`].
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Delivery>>,
    capacity: usize,
    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` is how many deliveries a slow receiver may fall behind
    /// before it starts losing them.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Delivery>> {
        self.sender.subscribe()
    }

    /// Encode `frame` and publish it to `audience`.
    ///
    /// Returns the number of receivers the delivery reached (before audience
    /// filtering).
    pub fn publish(&self, audience: Audience, frame: &Frame) -> Result<usize, ProtocolError> {
        let bytes = frame.encode()?;
        Ok(self.publish_raw(Arc::new(Delivery { audience, bytes })))
    }

    /// Publish an already encoded delivery.
    pub fn publish_raw(&self, delivery: Arc<Delivery>) -> usize {
        let count = self.sender.send(delivery).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record deliveries a lagging receiver skipped.
    pub fn record_dropped(&self, n: u64) {
        self.atomic_stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
