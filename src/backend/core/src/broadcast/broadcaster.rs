//! Fan-out of deltas to live subscribers.
//!
//! Each subscriber owns a bounded channel. `publish` uses `try_send` and never
//! waits: a subscriber whose buffer is full is closed on the spot and told so
//! with a backpressure notice once it has drained what was already buffered.
//! Slow subscribers therefore never slow down the publisher or each other.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::Stream;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tracing::{debug, warn};

use super::delta::{Delta, SubscriptionFilter};
use crate::telemetry::BroadcastMetrics;

/// Why a subscription stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum CloseReason {
    /// The subscriber fell `capacity` deltas behind
    Backpressure { capacity: usize },
    /// The broadcaster shut down
    Shutdown,
}

/// Item yielded by a [`Subscription`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Notification {
    Delta(Delta),
    /// Final item; nothing follows
    Closed(CloseReason),
}

impl Notification {
    pub fn into_delta(self) -> Option<Delta> {
        match self {
            Self::Delta(delta) => Some(delta),
            Self::Closed(_) => None,
        }
    }
}

/// Receiver of deltas produced while a writer lock is held.
///
/// Implementations must not block.
pub trait DeltaSink: Send + Sync {
    fn emit(&self, delta: Delta);
}

impl DeltaSink for Broadcaster {
    fn emit(&self, delta: Delta) {
        self.publish(delta);
    }
}

/// Broadcaster statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastStats {
    pub published: u64,
    pub delivered: u64,
    pub backpressure_closed: u64,
    pub subscribers: usize,
}

struct SubscriberHandle {
    filter: SubscriptionFilter,
    capacity: usize,
    /// `None` once closed; taken under the lock so no delta follows a close
    sender: Mutex<Option<mpsc::Sender<Delta>>>,
    reason: Arc<Mutex<Option<CloseReason>>>,
}

impl SubscriberHandle {
    fn close(&self, reason: CloseReason) -> bool {
        let mut sender = self.sender.lock();
        if sender.is_none() {
            return false;
        }
        *self.reason.lock() = Some(reason);
        sender.take();
        true
    }
}

#[derive(Default)]
struct Registry {
    subscribers: DashMap<u64, SubscriberHandle>,
    next_id: AtomicU64,
    published: AtomicU64,
    delivered: AtomicU64,
    backpressure_closed: AtomicU64,
}

/// Publishes deltas to every matching subscriber.
pub struct Broadcaster {
    registry: Arc<Registry>,
    capacity: usize,
}

impl Broadcaster {
    /// Broadcaster whose subscribers buffer up to `capacity` deltas.
    pub fn new(capacity: usize) -> Self {
        Self {
            registry: Arc::new(Registry::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        self.subscribe_with_capacity(filter, self.capacity)
    }

    /// Subscribe with a buffer size other than the default.
    pub fn subscribe_with_capacity(&self, filter: SubscriptionFilter, capacity: usize) -> Subscription {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let reason = Arc::new(Mutex::new(None));

        self.registry.subscribers.insert(
            id,
            SubscriberHandle {
                filter,
                capacity,
                sender: Mutex::new(Some(tx)),
                reason: reason.clone(),
            },
        );
        BroadcastMetrics::set_subscribers(self.registry.subscribers.len());
        debug!(subscriber = id, capacity, "Subscriber registered");

        Subscription {
            id,
            receiver: rx,
            reason,
            registry: Arc::downgrade(&self.registry),
            finished: false,
        }
    }

    /// Deliver `delta` to every matching subscriber without waiting.
    ///
    /// Returns the number of subscribers it was queued for.
    pub fn publish(&self, delta: Delta) -> usize {
        let registry = &self.registry;
        registry.published.fetch_add(1, Ordering::Relaxed);
        BroadcastMetrics::published(delta.kind());

        let mut delivered = 0usize;
        let mut gone = Vec::new();

        for entry in registry.subscribers.iter() {
            let handle = entry.value();
            if !handle.filter.matches(&delta) {
                continue;
            }

            let mut sender = handle.sender.lock();
            let Some(tx) = sender.as_ref() else {
                continue;
            };
            match tx.try_send(delta.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    *handle.reason.lock() = Some(CloseReason::Backpressure {
                        capacity: handle.capacity,
                    });
                    sender.take();
                    registry.backpressure_closed.fetch_add(1, Ordering::Relaxed);
                    BroadcastMetrics::backpressure_closed();
                    warn!(
                        subscriber = *entry.key(),
                        capacity = handle.capacity,
                        delta = delta.kind(),
                        "Subscriber buffer full, closing subscription"
                    );
                    gone.push(*entry.key());
                }
                Err(TrySendError::Closed(_)) => {
                    sender.take();
                    gone.push(*entry.key());
                }
            }
        }

        for id in gone {
            registry.subscribers.remove(&id);
        }
        if delivered > 0 {
            registry
                .delivered
                .fetch_add(delivered as u64, Ordering::Relaxed);
            BroadcastMetrics::delivered(delivered as u64);
        }
        BroadcastMetrics::set_subscribers(registry.subscribers.len());
        delivered
    }

    /// Close every subscription with [`CloseReason::Shutdown`].
    pub fn close_all(&self) {
        let ids: Vec<u64> = self.registry.subscribers.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, handle)) = self.registry.subscribers.remove(&id) {
                handle.close(CloseReason::Shutdown);
            }
        }
        BroadcastMetrics::set_subscribers(0);
        debug!("All subscriptions closed");
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.subscribers.len()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            published: self.registry.published.load(Ordering::Relaxed),
            delivered: self.registry.delivered.load(Ordering::Relaxed),
            backpressure_closed: self.registry.backpressure_closed.load(Ordering::Relaxed),
            subscribers: self.registry.subscribers.len(),
        }
    }
}

/// A live stream of deltas.
///
/// Yields buffered deltas in publish order, then a single
/// [`Notification::Closed`] if the broadcaster closed it. Dropping the
/// subscription unregisters it and frees its buffer.
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<Delta>,
    reason: Arc<Mutex<Option<CloseReason>>>,
    registry: Weak<Registry>,
    finished: bool,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next notification, waiting for one to arrive.
    pub async fn recv(&mut self) -> Option<Notification> {
        futures::StreamExt::next(self).await
    }

    /// Next notification if one is ready.
    pub fn try_recv(&mut self) -> Option<Notification> {
        if self.finished {
            return None;
        }
        match self.receiver.try_recv() {
            Ok(delta) => Some(Notification::Delta(delta)),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => self.finish(),
        }
    }

    fn finish(&mut self) -> Option<Notification> {
        self.finished = true;
        let reason = *self.reason.lock();
        reason.map(Notification::Closed)
    }
}

impl Stream for Subscription {
    type Item = Notification;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.receiver.poll_recv(cx) {
            Poll::Ready(Some(delta)) => Poll::Ready(Some(Notification::Delta(delta))),
            Poll::Ready(None) => Poll::Ready(self.finish()),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if registry.subscribers.remove(&self.id).is_some() {
                BroadcastMetrics::set_subscribers(registry.subscribers.len());
                debug!(subscriber = self.id, "Subscriber dropped");
            }
        }
    }
}
