//! Reactive states: a settable value and an auto-updating computation.

mod computed;
mod delayer;
mod mutable;

pub use computed::{ComputedState, ComputedStateOptions};
pub use delayer::{FixedDelayer, UiActionGuard, UiActionTracker, UiUpdateDelayer, UpdateDelayer};
pub use mutable::MutableState;

use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::computed::{Computed, ComputedCell, ConsistencyState};
use crate::key::{CacheKey, StateId};
use crate::registry::Registry;
use crate::signal::{HandlerKey, Handlers};

/// Observable counters of a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateSnapshot {
    /// Number of outputs installed so far.
    pub update_index: u64,
    /// Number of consecutive error outputs, reset by a successful one.
    pub error_count: u32,
}

/// What states have in common: the current computed, counters and events.
pub(crate) struct StateCore<T> {
    key: CacheKey,
    registry: Registry,
    current: Mutex<Arc<ComputedCell>>,
    snapshot: watch::Sender<StateSnapshot>,
    last_non_error: Mutex<Option<Arc<T>>>,
    invalidated: Handlers<StateSnapshot>,
    updated: Handlers<StateSnapshot>,
}

impl<T: Send + Sync + 'static> StateCore<T> {
    /// A core whose current computed is an unregistered placeholder without output.
    pub(crate) fn new(registry: &Registry, last_non_error: Option<Arc<T>>) -> Arc<Self> {
        let key = CacheKey::state(StateId::next());
        let placeholder = ComputedCell::computing(key.clone(), registry, None);
        let (snapshot, _) = watch::channel(StateSnapshot::default());
        Arc::new(Self {
            key,
            registry: registry.clone(),
            current: Mutex::new(placeholder),
            snapshot,
            last_non_error: Mutex::new(last_non_error),
            invalidated: Handlers::new(),
            updated: Handlers::new(),
        })
    }

    pub(crate) fn key(&self) -> &CacheKey {
        &self.key
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn current(&self) -> Arc<ComputedCell> {
        self.current.lock().clone()
    }

    pub(crate) fn computed(&self) -> Computed<T> {
        Computed::from_cell(self.current())
    }

    pub(crate) fn snapshot(&self) -> StateSnapshot {
        *self.snapshot.borrow()
    }

    pub(crate) fn last_non_error_value(&self) -> Option<Arc<T>> {
        self.last_non_error.lock().clone()
    }

    /// Make `cell` the current computed. The previous one is invalidated.
    pub(crate) fn install(self: &Arc<Self>, cell: Arc<ComputedCell>) {
        let (old, displaced) = {
            let mut current = self.current.lock();
            let old = mem::replace(&mut *current, cell.clone());
            // A computed invalidated on commit must not come back into the registry.
            let displaced = match cell.state() {
                ConsistencyState::Invalidated => None,
                _ => self.registry.replace(&cell),
            };
            (old, displaced)
        };
        if !Arc::ptr_eq(&old, &cell) {
            old.invalidate();
        }
        if let Some(displaced) = displaced {
            displaced.invalidate();
        }

        let failed = match cell.output() {
            Some(Ok(value)) => {
                if let Ok(value) = value.downcast::<T>() {
                    *self.last_non_error.lock() = Some(value);
                }
                false
            }
            Some(Err(_)) => true,
            None => false,
        };
        let mut snapshot = StateSnapshot::default();
        self.snapshot.send_modify(|s| {
            s.update_index += 1;
            s.error_count = if failed { s.error_count + 1 } else { 0 };
            snapshot = *s;
        });

        let weak = Arc::downgrade(self);
        cell.on_invalidated(Box::new(move || {
            if let Some(core) = weak.upgrade() {
                core.invalidated.fire(&core.snapshot());
            }
        }));
        tracing::trace!(key = ?self.key, update_index = snapshot.update_index, "state updated");
        self.updated.fire(&snapshot);
    }

    pub(crate) fn on_invalidated(
        &self,
        handler: impl Fn(&StateSnapshot) + Send + Sync + 'static,
    ) -> HandlerKey {
        self.invalidated.add(handler)
    }

    pub(crate) fn on_updated(
        &self,
        handler: impl Fn(&StateSnapshot) + Send + Sync + 'static,
    ) -> HandlerKey {
        self.updated.add(handler)
    }

    pub(crate) fn remove_invalidated_handler(&self, key: HandlerKey) -> bool {
        self.invalidated.remove(key)
    }

    pub(crate) fn remove_updated_handler(&self, key: HandlerKey) -> bool {
        self.updated.remove(key)
    }

    /// Wait for the next installed output.
    pub(crate) async fn when_updated(&self) {
        let mut rx = self.snapshot.subscribe();
        let _ = rx.changed().await;
    }

    /// Wait until at least `update_index` outputs were installed.
    pub(crate) async fn when_update_index(&self, update_index: u64) {
        let mut rx = self.snapshot.subscribe();
        let _ = rx.wait_for(|s| s.update_index >= update_index).await;
    }
}
