//! Terminal-transition notifications.
//!
//! Delivery is at-least-once: every terminal transition is persisted as a
//! [`crate::jobs::NotificationRecord`] in the same store transition as the
//! job status, and additionally pushed over an in-process broadcast
//! channel for low latency. A consumer that missed the push (slow, late,
//! or lagged off the ring buffer) recovers from the store; consumers that
//! cannot tolerate duplicates wrap their receiver in a
//! [`DedupSubscriber`].

use crate::jobs::JobStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Default ring-buffer capacity of the broadcast channel.
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// One pushed terminal-transition event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    /// The job that reached a terminal status.
    pub job_id: Uuid,
    /// Channel name.
    pub channel: String,
    /// Subject key.
    pub key: String,
    /// Pipeline kind.
    pub kind: String,
    /// Terminal status reached; only `Ok` and `Failed` are published.
    pub status: JobStatus,
    /// When the transition happened.
    pub timestamp: DateTime<Utc>,
}

/// In-process pub/sub fan-out for terminal transitions.
///
/// Subscribers that fall behind the ring buffer lose the oldest events;
/// that is acceptable because the persisted notifications remain the
/// source of truth.
#[derive(Debug, Clone)]
pub struct NotificationBus {
    sender: broadcast::Sender<NotificationEvent>,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl NotificationBus {
    /// Creates a bus with the given ring-buffer capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event to all current subscribers.
    ///
    /// Publishing with no subscribers is not an error; the persisted
    /// record already happened.
    pub fn publish(&self, event: NotificationEvent) {
        let receivers = self.sender.receiver_count();
        tracing::debug!(
            job_id = %event.job_id,
            key = %event.key,
            status = %event.status,
            receivers,
            "notification published"
        );
        let _ = self.sender.send(event);
    }

    /// Subscribes to events published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<NotificationEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Receiver wrapper that drops duplicate `(key, status)` deliveries.
///
/// At-least-once delivery means a consumer replaying from the store after
/// a lag can see the same transition twice; this filter makes that safe
/// for consumers that act on transitions.
#[derive(Debug)]
pub struct DedupSubscriber {
    receiver: broadcast::Receiver<NotificationEvent>,
    seen: HashSet<(String, JobStatus)>,
}

impl DedupSubscriber {
    /// Wraps a receiver.
    #[must_use]
    pub fn new(receiver: broadcast::Receiver<NotificationEvent>) -> Self {
        Self {
            receiver,
            seen: HashSet::new(),
        }
    }

    /// Receives the next unseen event.
    ///
    /// Returns `None` when the bus is closed. Ring-buffer lag is skipped
    /// over; the caller reconciles missed events from the store.
    pub async fn recv(&mut self) -> Option<NotificationEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    let fingerprint = (event.key.clone(), event.status);
                    if self.seen.insert(fingerprint) {
                        return Some(event);
                    }
                    tracing::trace!(key = %event.key, status = %event.status, "duplicate dropped");
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "notification subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Marks a fingerprint as already handled, e.g. after a store replay.
    pub fn mark_seen(&mut self, key: impl Into<String>, status: JobStatus) {
        self.seen.insert((key.into(), status));
    }
}
