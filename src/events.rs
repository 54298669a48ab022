//! Change notifications.
//!
//! Every mutation of the cache publishes one [`CacheEvent`] to each live
//! subscriber. Delivery is non-blocking: a full bounded channel drops the
//! event for that subscriber, and a disconnected subscriber is forgotten.

use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::key::EntityKey;
use crate::optimistic::OptimisticId;

/// What changed in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheEvent {
    /// Confirmed records were replaced.
    Written {
        /// Keys of the replaced records, sorted.
        keys: Vec<EntityKey>,
    },
    /// An optimistic patch was added to the overlay.
    OptimisticRecorded {
        /// Id of the new patch.
        id: OptimisticId,
        /// Keys the patch carries.
        keys: Vec<EntityKey>,
    },
    /// An optimistic patch was dropped and the overlay replayed.
    OptimisticRemoved {
        /// Id of the dropped patch.
        id: OptimisticId,
    },
    /// The cache was emptied.
    Reset,
    /// The confirmed store was swapped out wholesale.
    Replaced,
}

/// Fan-out of events to subscribers.
#[derive(Debug)]
pub(crate) struct EventHub {
    subscribers: Vec<Sender<CacheEvent>>,
    capacity: Option<usize>,
}

impl EventHub {
    pub(crate) fn new(capacity: Option<usize>) -> Self {
        Self {
            subscribers: Vec::new(),
            capacity,
        }
    }

    pub(crate) fn subscribe(&mut self) -> CacheEvents {
        let (tx, rx) = match self.capacity {
            Some(capacity) => bounded(capacity),
            None => unbounded(),
        };
        self.subscribers.push(tx);
        CacheEvents { rx }
    }

    pub(crate) fn publish(&mut self, event: &CacheEvent) {
        self.subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                trace!(?event, "subscriber channel full; event dropped");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

/// Receiving end of a cache subscription.
///
/// Dropping it unsubscribes on the next publish.
#[derive(Debug)]
pub struct CacheEvents {
    rx: Receiver<CacheEvent>,
}

impl CacheEvents {
    /// Next queued event, without blocking.
    #[must_use]
    pub fn try_recv(&self) -> Option<CacheEvent> {
        self.rx.try_recv().ok()
    }

    /// Waits up to `timeout` for the next event.
    #[must_use]
    pub fn recv_timeout(&self, timeout: Duration) -> Option<CacheEvent> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Every event queued so far.
    #[must_use]
    pub fn drain(&self) -> Vec<CacheEvent> {
        self.rx.try_iter().collect()
    }
}
