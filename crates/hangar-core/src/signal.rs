//! Synchronous multi-subscriber notification, the backbone of the
//! control-plane "signals" (state changes, register/unregister events,
//! model notifications).

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Handle returned by [`Signal::connect`], used to disconnect again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

/// A list of callbacks invoked in subscription order.
///
/// Emission is synchronous: `emit` returns after every subscriber has run.
/// Subscribers are cloned out of the registry before invocation, so a
/// callback may connect or disconnect subscribers without deadlocking; a
/// subscriber disconnected during an emission can still observe that same
/// emission.
pub struct Signal<T> {
    subscribers: Mutex<Vec<(u64, Arc<dyn Fn(&T) + Send + Sync>)>>,
    next_id: AtomicU64,
}

impl<T> Signal<T> {
    /// Create a signal with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a callback; it stays registered until disconnected.
    pub fn connect(&self, f: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push((id, Arc::new(f)));
        Subscription(id)
    }

    /// Remove a previously registered callback.
    ///
    /// Returns `false` if the subscription was not (or no longer) registered.
    pub fn disconnect(&self, subscription: Subscription) -> bool {
        let mut subs = self.subscribers.lock();
        let before = subs.len();
        subs.retain(|(id, _)| *id != subscription.0);
        subs.len() != before
    }

    /// Invoke every subscriber with `value`, in subscription order.
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<_> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, f)| Arc::clone(f))
            .collect();
        for f in snapshot {
            f(value);
        }
    }

    /// Number of currently connected subscribers.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Whether anyone is listening (used for coordinator-present decisions).
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.subscribers.lock().is_empty()
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("subscribers", &self.connection_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn emits_in_subscription_order() {
        let signal = Signal::<i32>::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in 0..3 {
            let order = Arc::clone(&order);
            signal.connect(move |v| order.lock().push((tag, *v)));
        }
        signal.emit(&7);

        assert_eq!(*order.lock(), vec![(0, 7), (1, 7), (2, 7)]);
    }

    #[test]
    fn disconnect_stops_delivery() {
        let signal = Signal::<()>::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        let sub = signal.connect(move |()| {
            h.fetch_add(1, Ordering::Relaxed);
        });
        signal.emit(&());
        assert!(signal.disconnect(sub));
        assert!(!signal.disconnect(sub));
        signal.emit(&());

        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn reentrant_connect_does_not_deadlock() {
        let signal = Arc::new(Signal::<()>::new());
        let inner = Arc::clone(&signal);
        signal.connect(move |()| {
            inner.connect(|()| {});
        });
        signal.emit(&());
        assert_eq!(signal.connection_count(), 2);
    }
}
