//! Unilateral publisher: multi-subscriber fan-out of JSON payloads.
//!
//! One publisher per root. Each subscriber owns a pending queue; an
//! `enqueue` appends to every live queue and fires each subscriber's
//! notify callback exactly once for the batch. Ordering is FIFO within a
//! subscriber; there is no total order across publishers. Delivery is
//! best-effort in-memory: dropping a subscriber discards its buffer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;

/// A single published payload.
#[derive(Debug)]
pub struct Item {
    pub payload: Value,
}

type NotifyFn = Box<dyn Fn() + Send + Sync>;

struct SubscriberInner {
    pending: Mutex<VecDeque<Arc<Item>>>,
    on_notify: NotifyFn,
}

/// Handle returned by [`Publisher::subscribe`].
///
/// Dropping it unsubscribes; anything still buffered is discarded.
pub struct Subscriber {
    inner: Arc<SubscriberInner>,
}

impl Subscriber {
    /// Drain all pending items into `out`, preserving enqueue order.
    pub fn get_pending(&self, out: &mut Vec<Arc<Item>>) {
        let mut pending = self.inner.pending.lock().expect("publisher queue poisoned");
        out.extend(pending.drain(..));
    }

    pub fn has_pending(&self) -> bool {
        !self
            .inner
            .pending
            .lock()
            .expect("publisher queue poisoned")
            .is_empty()
    }

    /// A non-owning handle; lets a notify callback drain the queue
    /// without keeping the subscription alive.
    pub fn downgrade(&self) -> WeakSubscriber {
        WeakSubscriber {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// Weak counterpart to [`Subscriber`]. Draining through a dead handle is
/// a no-op.
#[derive(Clone)]
pub struct WeakSubscriber {
    inner: Weak<SubscriberInner>,
}

impl WeakSubscriber {
    pub fn get_pending(&self, out: &mut Vec<Arc<Item>>) -> bool {
        match self.inner.upgrade() {
            Some(inner) => {
                let mut pending = inner.pending.lock().expect("publisher queue poisoned");
                out.extend(pending.drain(..));
                true
            }
            None => false,
        }
    }
}

#[derive(Default)]
pub struct Publisher {
    subscribers: Mutex<Vec<Weak<SubscriberInner>>>,
}

impl Publisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. `on_notify` fires once per enqueue batch,
    /// on the publishing thread.
    pub fn subscribe(&self, on_notify: impl Fn() + Send + Sync + 'static) -> Subscriber {
        let inner = Arc::new(SubscriberInner {
            pending: Mutex::new(VecDeque::new()),
            on_notify: Box::new(on_notify),
        });
        self.subscribers
            .lock()
            .expect("publisher list poisoned")
            .push(Arc::downgrade(&inner));
        Subscriber { inner }
    }

    /// Append `payload` to every live subscriber queue and notify each.
    /// Dead subscribers are pruned as a side effect.
    pub fn enqueue(&self, payload: Value) {
        let item = Arc::new(Item { payload });
        let mut live = Vec::new();
        {
            let mut subscribers = self.subscribers.lock().expect("publisher list poisoned");
            subscribers.retain(|weak| match weak.upgrade() {
                Some(inner) => {
                    inner
                        .pending
                        .lock()
                        .expect("publisher queue poisoned")
                        .push_back(Arc::clone(&item));
                    live.push(inner);
                    true
                }
                None => false,
            });
        }
        // Fire callbacks outside the subscriber-list lock so a callback may
        // subscribe or drop subscriptions without deadlocking.
        for inner in live {
            (inner.on_notify)();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("publisher list poisoned")
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}
