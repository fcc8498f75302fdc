//! Small synchronization primitives: a one-shot broadcast token and handler sets.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use slab::Slab;
use tokio::sync::watch;

/// One-shot broadcast signal.
///
/// Cloning shares the signal. Once cancelled, it stays cancelled and every waiter (current and
/// future) completes.
#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    /// Create a new, not yet cancelled token.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Cancel the token. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Returns true if the token was cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Key of a registered handler, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerKey(usize);

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Set of repeating event handlers.
pub struct Handlers<E> {
    slots: Mutex<Slab<Handler<E>>>,
}

impl<E> Handlers<E> {
    /// Create an empty set.
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Slab::new()),
        }
    }

    /// Register a handler.
    pub fn add(&self, handler: impl Fn(&E) + Send + Sync + 'static) -> HandlerKey {
        HandlerKey(self.slots.lock().insert(Arc::new(handler)))
    }

    /// Remove a handler. Returns false if it was not registered.
    pub fn remove(&self, key: HandlerKey) -> bool {
        self.slots.lock().try_remove(key.0).is_some()
    }

    /// Invoke all handlers with `event`.
    ///
    /// Handlers run outside the lock, so they may register or remove handlers.
    pub fn fire(&self, event: &E) {
        let handlers: Vec<Handler<E>> = self.slots.lock().iter().map(|(_, h)| h.clone()).collect();
        for handler in handlers {
            handler(event);
        }
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Returns true if no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E> Default for Handlers<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Set of handlers that run at most once. Owned by the caller's lock.
pub(crate) struct OnceHandlers {
    slots: Slab<Box<dyn FnOnce() + Send>>,
}

impl OnceHandlers {
    pub(crate) fn new() -> Self {
        Self { slots: Slab::new() }
    }

    pub(crate) fn add(&mut self, handler: Box<dyn FnOnce() + Send>) -> HandlerKey {
        HandlerKey(self.slots.insert(handler))
    }

    pub(crate) fn remove(&mut self, key: HandlerKey) -> bool {
        self.slots.try_remove(key.0).is_some()
    }

    /// Take every handler out, leaving the set empty.
    pub(crate) fn take(&mut self) -> Vec<Box<dyn FnOnce() + Send>> {
        self.slots.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_wakes_current_and_future_waiters() {
        let token = CancelToken::new();
        let waiter = tokio::spawn({
            let token = token.clone();
            async move { token.cancelled().await }
        });
        tokio::task::yield_now().await;
        assert!(!token.is_cancelled());
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        // Already cancelled.
        token.cancelled().await;
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn handlers_fire_until_removed() {
        let handlers = Handlers::<usize>::new();
        let total = Arc::new(AtomicUsize::new(0));
        let key = handlers.add({
            let total = total.clone();
            move |n| {
                total.fetch_add(*n, Ordering::SeqCst);
            }
        });
        handlers.fire(&2);
        handlers.fire(&3);
        assert!(handlers.remove(key));
        handlers.fire(&100);
        assert_eq!(total.load(Ordering::SeqCst), 5);
        assert!(!handlers.remove(key));
        assert!(handlers.is_empty());
    }

    #[test]
    fn once_handlers_are_taken() {
        let mut handlers = OnceHandlers::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let hits = hits.clone();
            handlers.add(Box::new(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            }));
        }
        let removed = handlers.add(Box::new(|| panic!("removed handler ran")));
        assert!(handlers.remove(removed));
        for handler in handlers.take() {
            handler();
        }
        assert!(handlers.take().is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
