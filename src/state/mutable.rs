use std::fmt;
use std::sync::{Arc, Weak};

use futures::FutureExt;

use super::{StateCore, StateSnapshot};
use crate::computed::{AnyValue, Computed, ComputedCell, Output, Renewer};
use crate::context::ComputeContext;
use crate::error::{ComputeError, ProtocolError};
use crate::registry::Registry;
use crate::signal::HandlerKey;

/// A settable value that computations can depend on.
///
/// Every `set` invalidates the computed holding the previous value, and with it everything
/// that used it, then installs a new consistent computed.
pub struct MutableState<T> {
    core: Arc<StateCore<T>>,
}

impl<T> Clone for MutableState<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for MutableState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutableState")
            .field("key", self.core.key())
            .field("snapshot", &self.core.snapshot())
            .finish()
    }
}

impl<T: Send + Sync + 'static> MutableState<T> {
    /// Create a state holding `value`.
    pub fn new(registry: &Registry, value: T) -> Self {
        let state = Self {
            core: StateCore::new(registry, None),
        };
        state.set(value);
        state
    }

    /// Replace the value.
    pub fn set(&self, value: T) {
        self.install(Ok(Arc::new(value) as AnyValue));
    }

    /// Replace the value with an error.
    pub fn set_error(&self, error: impl Into<anyhow::Error>) {
        self.install(Err(ComputeError::user(error)));
    }

    /// Replace the value with `result`.
    pub fn set_result(&self, result: Result<T, ComputeError>) {
        self.install(result.map(|value| Arc::new(value) as AnyValue));
    }

    fn install(&self, output: Output) {
        install_output(&self.core, output);
    }

    /// The current value.
    pub fn value(&self) -> Result<Arc<T>, ComputeError> {
        self.core.computed().value()
    }

    /// The latest successfully set value.
    pub fn last_non_error_value(&self) -> Option<Arc<T>> {
        self.core.last_non_error_value()
    }

    /// The computed holding the current value.
    pub fn computed(&self) -> Computed<T> {
        self.core.computed()
    }

    /// Read the value as a dependency of the computation behind `ctx`.
    pub fn use_in(&self, ctx: &ComputeContext) -> Result<Arc<T>, ComputeError> {
        let current = self.core.current();
        let current = if current.is_consistent() || ctx.is_invalidating() {
            current
        } else {
            // Invalidated from outside: the value itself did not change.
            reinstall(&self.core)
        };
        Computed::<T>::from_cell(current).use_in(ctx)
    }

    /// Counters of this state.
    pub fn snapshot(&self) -> StateSnapshot {
        self.core.snapshot()
    }

    /// Number of values set so far.
    pub fn update_index(&self) -> u64 {
        self.core.snapshot().update_index
    }

    /// Run `handler` each time the current computed is invalidated.
    pub fn on_invalidated(
        &self,
        handler: impl Fn(&StateSnapshot) + Send + Sync + 'static,
    ) -> HandlerKey {
        self.core.on_invalidated(handler)
    }

    /// Run `handler` each time a value is set.
    pub fn on_updated(&self, handler: impl Fn(&StateSnapshot) + Send + Sync + 'static) -> HandlerKey {
        self.core.on_updated(handler)
    }

    /// Remove a handler registered with [`MutableState::on_invalidated`].
    pub fn remove_invalidated_handler(&self, key: HandlerKey) -> bool {
        self.core.remove_invalidated_handler(key)
    }

    /// Remove a handler registered with [`MutableState::on_updated`].
    pub fn remove_updated_handler(&self, key: HandlerKey) -> bool {
        self.core.remove_updated_handler(key)
    }

    /// Wait for the next `set`.
    pub async fn when_updated(&self) {
        self.core.when_updated().await
    }
}

fn install_output<T: Send + Sync + 'static>(core: &Arc<StateCore<T>>, output: Output) {
    let cell = ComputedCell::consistent(
        core.key().clone(),
        core.registry(),
        output,
        Some(renewer(Arc::downgrade(core))),
    );
    core.install(cell);
}

fn reinstall<T: Send + Sync + 'static>(core: &Arc<StateCore<T>>) -> Arc<ComputedCell> {
    let current = core.current();
    if current.is_consistent() {
        return current;
    }
    let Some(output) = current.output() else {
        return current;
    };
    install_output(core, output);
    core.current()
}

fn renewer<T: Send + Sync + 'static>(core: Weak<StateCore<T>>) -> Renewer {
    Arc::new(move || {
        let core = core.upgrade();
        async move {
            match core {
                Some(core) => Ok(reinstall(&core)),
                None => Err(ProtocolError::Disposed.into()),
            }
        }
        .boxed()
    })
}
