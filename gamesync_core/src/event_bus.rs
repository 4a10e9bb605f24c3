// Typed publish/subscribe, one bus per event kind.
//
// Subscribers run synchronously, in subscription order, on the emitting task.
// Each subscriber returns a `Flow`: `Continue` hands the (possibly modified)
// event to the next subscriber, `Stop` ends this emission early. Emission
// iterates a snapshot of the subscriber list, so a subscriber may subscribe or
// unsubscribe (itself included) without deadlocking; the change applies from
// the next emission.
//
// `Flow` is shared with the ordered dispatcher (`dispatch.rs`), whose async
// handlers short-circuit the same way.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::lock;

/// Outcome of one subscriber or handler invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Flow<T> {
    Continue(T),
    Stop(T),
}

impl<T> Flow<T> {
    pub fn into_inner(self) -> T {
        match self {
            Flow::Continue(v) | Flow::Stop(v) => v,
        }
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, Flow::Stop(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Subscriber<T> = Arc<dyn Fn(T) -> Flow<T> + Send + Sync>;

pub struct EventBus<T> {
    subscribers: Mutex<Vec<(SubscriptionId, Subscriber<T>)>>,
    next_id: AtomicU64,
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventBus<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn subscribe<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(T) -> Flow<T> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.subscribers).push((id, Arc::new(f)));
        id
    }

    /// Subscribe an observer that never alters or stops the event.
    pub fn listen<F>(&self, f: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.subscribe(move |event| {
            f(&event);
            Flow::Continue(event)
        })
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = lock(&self.subscribers);
        let before = subs.len();
        subs.retain(|(sid, _)| *sid != id);
        subs.len() != before
    }

    pub fn len(&self) -> usize {
        lock(&self.subscribers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every subscriber in order until one stops it.
    pub fn emit(&self, event: T) -> Flow<T> {
        let snapshot: Vec<Subscriber<T>> = lock(&self.subscribers)
            .iter()
            .map(|(_, f)| Arc::clone(f))
            .collect();
        let mut event = event;
        for subscriber in snapshot {
            match subscriber(event) {
                Flow::Continue(next) => event = next,
                Flow::Stop(last) => return Flow::Stop(last),
            }
        }
        Flow::Continue(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribers_run_in_order_and_thread_the_event() {
        let bus: EventBus<Vec<&'static str>> = EventBus::new();
        bus.subscribe(|mut v| {
            v.push("first");
            Flow::Continue(v)
        });
        bus.subscribe(|mut v| {
            v.push("second");
            Flow::Continue(v)
        });
        let out = bus.emit(Vec::new());
        assert_eq!(out, Flow::Continue(vec!["first", "second"]));
    }

    #[test]
    fn stop_skips_later_subscribers() {
        let bus: EventBus<u32> = EventBus::new();
        let seen = Arc::new(AtomicU64::new(0));
        bus.subscribe(|n| Flow::Stop(n + 1));
        let counter = Arc::clone(&seen);
        bus.listen(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(bus.emit(1), Flow::Stop(2));
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unsubscribe_removes_only_that_subscriber() {
        let bus: EventBus<u32> = EventBus::new();
        let a = bus.subscribe(|n| Flow::Continue(n * 10));
        bus.subscribe(|n| Flow::Continue(n + 1));
        assert!(bus.unsubscribe(a));
        assert!(!bus.unsubscribe(a));
        assert_eq!(bus.len(), 1);
        assert_eq!(bus.emit(1), Flow::Continue(2));
    }

    #[test]
    fn subscriber_may_subscribe_during_emit() {
        let bus: Arc<EventBus<u32>> = Arc::new(EventBus::new());
        let inner = Arc::clone(&bus);
        bus.subscribe(move |n| {
            inner.listen(|_| {});
            Flow::Continue(n)
        });
        bus.emit(0);
        assert_eq!(bus.len(), 2);
    }
}
