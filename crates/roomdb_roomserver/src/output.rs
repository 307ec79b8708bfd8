//! Delivery of applied events to downstream consumers.
//!
//! The room updater hands every committed [`OutputNewRoomEvent`] to an
//! [`OutputProducer`]. [`OutputFeed`] is the in-process producer: it numbers
//! outputs in publish order, fans them out to subscribers and keeps a bounded
//! history so a late consumer can catch up by polling.

use crate::types::OutputNewRoomEvent;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};

/// Receives outputs after their transaction commits.
pub trait OutputProducer: Send + Sync {
    /// Publishes one output. Must not block on consumers.
    fn publish(&self, event: OutputNewRoomEvent);
}

/// One published output.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedItem {
    /// Publish order, starting at 1.
    pub sequence: u64,
    /// The output.
    pub event: OutputNewRoomEvent,
}

/// In-process output queue.
///
/// - Preserves publish order
/// - Supports multiple subscribers
/// - Drops subscribers whose receiver is gone
pub struct OutputFeed {
    subscribers: RwLock<Vec<Sender<FeedItem>>>,
    /// Recent items, oldest first. Holding this lock while sending keeps
    /// sequence order and delivery order the same.
    history: RwLock<Vec<FeedItem>>,
    max_history: usize,
    sequence: AtomicU64,
}

impl OutputFeed {
    /// Creates a feed with the default history size.
    pub fn new() -> Self {
        Self::with_max_history(10_000)
    }

    /// Creates a feed keeping at most `max_history` items for polling.
    pub fn with_max_history(max_history: usize) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            history: RwLock::new(Vec::new()),
            max_history,
            sequence: AtomicU64::new(0),
        }
    }

    /// Returns a receiver of every item published from now on.
    pub fn subscribe(&self) -> Receiver<FeedItem> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Items with a sequence above `cursor`, oldest first, at most `limit`.
    pub fn poll(&self, cursor: u64, limit: usize) -> Vec<FeedItem> {
        self.history
            .read()
            .iter()
            .filter(|item| item.sequence > cursor)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Sequence of the most recent item, 0 before the first publish.
    pub fn latest_sequence(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    /// Returns the number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Returns the number of items held for polling.
    pub fn history_len(&self) -> usize {
        self.history.read().len()
    }
}

impl OutputProducer for OutputFeed {
    fn publish(&self, event: OutputNewRoomEvent) {
        let mut history = self.history.write();
        let item = FeedItem {
            sequence: self.sequence.fetch_add(1, Ordering::AcqRel) + 1,
            event,
        };
        history.push(item.clone());
        if history.len() > self.max_history {
            let excess = history.len() - self.max_history;
            history.drain(..excess);
        }
        self.subscribers
            .write()
            .retain(|tx| tx.send(item.clone()).is_ok());
    }
}

impl Default for OutputFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OutputFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputFeed")
            .field("subscribers", &self.subscriber_count())
            .field("history", &self.history_len())
            .field("max_history", &self.max_history)
            .finish()
    }
}
