//! Bounded multi-subscriber event bus.
//!
//! Fan-out of JSON event objects to N independent subscribers. Publishing
//! never blocks and never fails: when a subscriber's queue is full the oldest
//! buffered event is dropped to make room, so slow consumers lose history
//! rather than stalling the publisher. Per-subscriber FIFO order is
//! guaranteed; ordering across subscribers is not.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;

/// Events are flat JSON objects with at least `type` and `timestamp`.
pub type Event = serde_json::Value;

/// Default per-subscriber queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

struct SubscriberQueue {
    buffer: Mutex<VecDeque<Event>>,
    notify: Notify,
}

struct BusInner {
    subscribers: Mutex<Vec<Arc<SubscriberQueue>>>,
    capacity: usize,
}

/// Cloneable handle to a shared event bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus with the given per-subscriber queue capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(Vec::new()),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Register a new subscriber and return its receiving handle.
    pub fn subscribe(&self) -> Subscription {
        let queue = Arc::new(SubscriberQueue {
            buffer: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        });
        if let Ok(mut subscribers) = self.inner.subscribers.lock() {
            subscribers.push(Arc::clone(&queue));
        }
        Subscription {
            bus: Arc::downgrade(&self.inner),
            queue,
        }
    }

    /// Remove a subscriber. Safe to call more than once.
    pub fn unsubscribe(&self, subscription: &Subscription) {
        if let Ok(mut subscribers) = self.inner.subscribers.lock() {
            subscribers.retain(|q| !Arc::ptr_eq(q, &subscription.queue));
        }
    }

    /// Publish an event to every current subscriber.
    ///
    /// Snapshots the subscriber set, then enqueues into each queue,
    /// dropping that queue's oldest event first when it is at capacity.
    pub fn publish(&self, event: Event) {
        let snapshot: Vec<Arc<SubscriberQueue>> = match self.inner.subscribers.lock() {
            Ok(subscribers) => subscribers.clone(),
            Err(_) => return,
        };

        for queue in snapshot {
            if let Ok(mut buffer) = queue.buffer.lock() {
                if buffer.len() >= self.inner.capacity {
                    buffer.pop_front();
                }
                buffer.push_back(event.clone());
            }
            queue.notify.notify_one();
        }
    }

    /// Number of currently registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

/// Receiving side of one subscription.
///
/// Dropping the subscription unregisters it from the bus.
pub struct Subscription {
    bus: Weak<BusInner>,
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    /// Take the next buffered event without waiting.
    pub fn try_recv(&self) -> Option<Event> {
        self.queue
            .buffer
            .lock()
            .ok()
            .and_then(|mut buffer| buffer.pop_front())
    }

    /// Wait for the next event.
    pub async fn recv(&self) -> Event {
        loop {
            if let Some(event) = self.try_recv() {
                return event;
            }
            self.queue.notify.notified().await;
        }
    }

    /// Drain all currently buffered events.
    pub fn drain(&self) -> Vec<Event> {
        match self.queue.buffer.lock() {
            Ok(mut buffer) => buffer.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            if let Ok(mut subscribers) = inner.subscribers.lock() {
                subscribers.retain(|q| !Arc::ptr_eq(q, &self.queue));
            }
        }
    }
}
