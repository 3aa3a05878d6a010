//! Typed event buses. Emission is crate-internal; embedders receive a
//! listen-only [`Events`] handle, so a query's events can only ever originate
//! from the query itself.
//!
//! Dispatch is deferred: `emit` enqueues on an unbounded channel drained by a
//! single dispatcher task per bus. Listeners registered immediately after the
//! call that emitted still observe the event, delivery order per bus is issue
//! order, and emitters never re-enter listeners.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;

use crate::task;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync + 'static>;

struct Entry<T> {
    listener: Listener<T>,
    once: bool,
}

struct BusInner<T> {
    tx: mpsc::UnboundedSender<T>,
    listeners: Mutex<HashMap<usize, Entry<T>>>,
    next_id: AtomicUsize,
}

pub(crate) struct EventBus<T> {
    inner: Arc<BusInner<T>>,
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self { Self { inner: self.inner.clone() } }
}

impl<T: Send + Sync + 'static> EventBus<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(BusInner { tx, listeners: Mutex::new(HashMap::new()), next_id: AtomicUsize::new(0) });
        task::spawn(dispatch(rx, Arc::downgrade(&inner)));
        Self { inner }
    }

    pub fn emit(&self, event: T) {
        // The dispatcher only dies when the bus does, so a send error just
        // means nobody is left to care.
        let _ = self.inner.tx.send(event);
    }

    /// A listen-only handle, safe to give out.
    pub fn handle(&self) -> Events<T> { Events { inner: self.inner.clone() } }
}

async fn dispatch<T>(mut rx: mpsc::UnboundedReceiver<T>, inner: Weak<BusInner<T>>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else { break };
        let batch = {
            let mut listeners = inner.listeners.lock().expect("event bus lock");
            let mut batch: Vec<(usize, Listener<T>)> = listeners.iter().map(|(id, e)| (*id, e.listener.clone())).collect();
            // Registration order, for deterministic delivery
            batch.sort_unstable_by_key(|(id, _)| *id);
            listeners.retain(|_, e| !e.once);
            batch
        };
        drop(inner);
        for (_, listener) in batch {
            (*listener)(&event);
        }
    }
}

/// Listen-only access to an event bus. Subscriptions unsubscribe when their
/// guard drops.
pub struct Events<T> {
    inner: Arc<BusInner<T>>,
}

impl<T> Clone for Events<T> {
    fn clone(&self) -> Self { Self { inner: self.inner.clone() } }
}

impl<T: Send + Sync + 'static> Events<T> {
    pub fn on(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> ListenerGuard { self.subscribe(listener, false) }

    /// One-shot subscription: removed after the first delivery.
    pub fn once(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> ListenerGuard { self.subscribe(listener, true) }

    fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static, once: bool) -> ListenerGuard {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().expect("event bus lock").insert(id, Entry { listener: Arc::new(listener), once });

        let weak = Arc::downgrade(&self.inner);
        ListenerGuard(Some(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners.lock().expect("event bus lock").remove(&id);
            }
        })))
    }
}

/// Removes its subscription when dropped.
pub struct ListenerGuard(Option<Box<dyn FnOnce() + Send + Sync>>);

impl ListenerGuard {
    /// Keep the subscription alive for the lifetime of the bus.
    pub fn forget(mut self) { self.0 = None; }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.0.take() {
            unsubscribe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    async fn settle() { tokio::task::yield_now().await }

    #[tokio::test]
    async fn listeners_registered_after_emit_still_observe_it() {
        let bus: EventBus<u32> = EventBus::new();
        bus.emit(1);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _guard = bus.handle().on(move |v| s.lock().unwrap().push(*v));

        bus.emit(2);
        for _ in 0..4 {
            settle().await;
        }
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn once_listeners_fire_a_single_time() {
        let bus: EventBus<u32> = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        let _guard = bus.handle().once(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(1);
        bus.emit(2);
        for _ in 0..4 {
            settle().await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropping_the_guard_unsubscribes() {
        let bus: EventBus<u32> = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        let guard = bus.handle().on(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(1);
        for _ in 0..4 {
            settle().await;
        }
        drop(guard);
        bus.emit(2);
        for _ in 0..4 {
            settle().await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
