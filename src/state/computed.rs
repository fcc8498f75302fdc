use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Mutex as AsyncMutex;

use super::{FixedDelayer, StateCore, StateSnapshot, UpdateDelayer};
use crate::computed::{AnyValue, Computed, ComputedCell, Renewer};
use crate::context::ComputeContext;
use crate::error::{ComputeError, ProtocolError};
use crate::function::CancelOnDrop;
use crate::registry::Registry;
use crate::signal::{CancelToken, HandlerKey};
use crate::tracer::ComputeOutcome;

type Computer<T> = dyn Fn(ComputeContext) -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync;

/// Options of a [`ComputedState`].
pub struct ComputedStateOptions<T> {
    /// Value reported by [`ComputedState::value`] until the first computation succeeds.
    pub initial_value: Option<T>,
    /// How long to wait after an invalidation before recomputing.
    pub update_delayer: Arc<dyn UpdateDelayer>,
}

impl<T> ComputedStateOptions<T> {
    /// Report `value` until the first computation succeeds.
    pub fn with_initial_value(mut self, value: T) -> Self {
        self.initial_value = Some(value);
        self
    }

    /// Use `delayer` between invalidation and recomputation.
    pub fn with_delayer(mut self, delayer: impl UpdateDelayer) -> Self {
        self.update_delayer = Arc::new(delayer);
        self
    }
}

impl<T> Default for ComputedStateOptions<T> {
    fn default() -> Self {
        Self {
            initial_value: None,
            update_delayer: Arc::new(FixedDelayer::zero()),
        }
    }
}

impl<T> fmt::Debug for ComputedStateOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputedStateOptions")
            .field("has_initial_value", &self.initial_value.is_some())
            .finish_non_exhaustive()
    }
}

struct ComputedStateInner<T> {
    core: Arc<StateCore<T>>,
    computer: Box<Computer<T>>,
    delayer: Arc<dyn UpdateDelayer>,
    dispose: CancelToken,
    update_lock: AsyncMutex<()>,
    initialized: AtomicBool,
}

impl<T> Drop for ComputedStateInner<T> {
    fn drop(&mut self) {
        self.dispose.cancel();
    }
}

/// A state whose value is produced by an async computer and kept up to date.
///
/// Once [initialized](ComputedState::initialize), every invalidation of the current computed
/// schedules a recomputation: the state waits for its [`UpdateDelayer`], runs the computer
/// again and installs the result. Invalidations arriving while it waits are folded into that
/// one recomputation.
///
/// The update cycle only holds a weak reference, so dropping the last handle stops it.
pub struct ComputedState<T> {
    inner: Arc<ComputedStateInner<T>>,
}

impl<T> Clone for ComputedState<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for ComputedState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputedState")
            .field("key", self.inner.core.key())
            .field("snapshot", &self.inner.core.snapshot())
            .field("disposed", &self.inner.dispose.is_cancelled())
            .finish()
    }
}

impl<T: Send + Sync + 'static> ComputedState<T> {
    /// Create a state around `computer`. Nothing runs until [`ComputedState::initialize`].
    pub fn new<F, Fut>(registry: &Registry, options: ComputedStateOptions<T>, computer: F) -> Self
    where
        F: Fn(ComputeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let core = StateCore::new(registry, options.initial_value.map(Arc::new));
        Self {
            inner: Arc::new(ComputedStateInner {
                core,
                computer: Box::new(move |ctx| computer(ctx).boxed()),
                delayer: options.update_delayer,
                dispose: CancelToken::new(),
                update_lock: AsyncMutex::new(()),
                initialized: AtomicBool::new(false),
            }),
        }
    }

    /// Run the computer once and start the update cycle.
    ///
    /// Calling it again only refreshes the value if it is stale.
    pub async fn initialize(&self) -> Result<Computed<T>, ComputeError> {
        let cell = self.inner.update().await?;
        if !self.inner.initialized.swap(true, Ordering::SeqCst) {
            spawn_update_cycle(&self.inner);
        }
        Ok(Computed::from_cell(cell))
    }

    /// Recompute now if the current computed is not consistent, skipping any pending delay.
    pub async fn update(&self) -> Result<Computed<T>, ComputeError> {
        self.inner.update().await.map(Computed::from_cell)
    }

    /// Read the value as a dependency of the computation behind `ctx`.
    ///
    /// A stale value is refreshed first instead of waiting for the update delay.
    pub async fn use_in(&self, ctx: &ComputeContext) -> Result<Arc<T>, ComputeError> {
        let current = self.inner.core.current();
        if ctx.is_invalidating() || current.is_consistent() || self.is_disposed() {
            return Computed::<T>::from_cell(current).use_in(ctx);
        }
        if let Some(path) = ctx.cycle_path(self.inner.core.key()) {
            return Err(ComputeError::Cycle { path });
        }
        let cell = self.inner.update().await?;
        Computed::<T>::from_cell(cell).use_in(ctx)
    }

    /// The current value, falling back to the last successful one while the current computed
    /// holds an error or is not produced yet.
    pub fn value(&self) -> Result<Arc<T>, ComputeError> {
        let current = self.inner.core.computed();
        match current.output() {
            Some(Ok(value)) => Ok(value),
            Some(Err(err)) => self.last_non_error_value().ok_or(err),
            None => self.last_non_error_value().ok_or_else(|| {
                ProtocolError::NoOutput {
                    key: current.key().debug_repr(),
                }
                .into()
            }),
        }
    }

    /// The error held by the current computed, if any.
    pub fn error(&self) -> Option<ComputeError> {
        match self.inner.core.current().output() {
            Some(Err(err)) => Some(err),
            _ => None,
        }
    }

    /// The latest successfully computed value (or the initial value).
    pub fn last_non_error_value(&self) -> Option<Arc<T>> {
        self.inner.core.last_non_error_value()
    }

    /// The current computed.
    pub fn computed(&self) -> Computed<T> {
        self.inner.core.computed()
    }

    /// Counters of this state.
    pub fn snapshot(&self) -> StateSnapshot {
        self.inner.core.snapshot()
    }

    /// Number of outputs installed so far.
    pub fn update_index(&self) -> u64 {
        self.inner.core.snapshot().update_index
    }

    /// Run `handler` each time the current computed is invalidated.
    pub fn on_invalidated(
        &self,
        handler: impl Fn(&StateSnapshot) + Send + Sync + 'static,
    ) -> HandlerKey {
        self.inner.core.on_invalidated(handler)
    }

    /// Run `handler` each time a recomputation completes.
    pub fn on_updated(&self, handler: impl Fn(&StateSnapshot) + Send + Sync + 'static) -> HandlerKey {
        self.inner.core.on_updated(handler)
    }

    /// Remove a handler registered with [`ComputedState::on_invalidated`].
    pub fn remove_invalidated_handler(&self, key: HandlerKey) -> bool {
        self.inner.core.remove_invalidated_handler(key)
    }

    /// Remove a handler registered with [`ComputedState::on_updated`].
    pub fn remove_updated_handler(&self, key: HandlerKey) -> bool {
        self.inner.core.remove_updated_handler(key)
    }

    /// Wait for the next installed output.
    pub async fn when_updated(&self) {
        self.inner.core.when_updated().await
    }

    /// Wait until at least `update_index` outputs were installed.
    pub async fn when_update_index(&self, update_index: u64) {
        self.inner.core.when_update_index(update_index).await
    }

    /// Stop the update cycle for good. The current computed is left as it is.
    pub fn dispose(&self) {
        if !self.inner.dispose.is_cancelled() {
            tracing::debug!(key = ?self.inner.core.key(), "state disposed");
        }
        self.inner.dispose.cancel();
    }

    /// Returns true once [`ComputedState::dispose`] was called.
    pub fn is_disposed(&self) -> bool {
        self.inner.dispose.is_cancelled()
    }
}

impl<T: Send + Sync + 'static> ComputedStateInner<T> {
    async fn update(self: &Arc<Self>) -> Result<Arc<ComputedCell>, ComputeError> {
        let _lock = self.update_lock.lock().await;
        let current = self.core.current();
        if current.is_consistent() {
            return Ok(current);
        }
        if self.dispose.is_cancelled() {
            return Err(ProtocolError::Disposed.into());
        }

        let registry = self.core.registry();
        let cell = ComputedCell::computing(
            self.core.key().clone(),
            registry,
            Some(renewer(Arc::downgrade(self))),
        );
        registry.register(&cell);
        registry.tracer().on_compute_start(cell.key());

        let ctx = ComputeContext::none().child(cell.clone());
        let mut guard = CancelOnDrop::new(cell.clone());
        let result = (self.computer)(ctx.clone()).await;
        guard.disarm();
        let dependencies = ctx.take_dependencies();

        let (output, outcome) = match result {
            Ok(value) => (Ok(Arc::new(value) as AnyValue), ComputeOutcome::Value),
            Err(err) => {
                let err = ComputeError::from(err);
                let message = err.to_string();
                if err.is_system() {
                    cell.cancel();
                    registry.tracer().on_compute_end(
                        cell.key(),
                        cell.version(),
                        ComputeOutcome::Discarded { message },
                    );
                    return Err(err);
                }
                (Err(err), ComputeOutcome::Error { message })
            }
        };
        cell.set_output(output, dependencies)?;
        registry
            .tracer()
            .on_compute_end(cell.key(), cell.version(), outcome);
        self.core.install(cell.clone());
        Ok(cell)
    }
}

fn renewer<T: Send + Sync + 'static>(inner: Weak<ComputedStateInner<T>>) -> Renewer {
    Arc::new(move || {
        let inner = inner.upgrade();
        async move {
            match inner {
                Some(inner) => inner.update().await,
                None => Err(ProtocolError::Disposed.into()),
            }
        }
        .boxed()
    })
}

fn spawn_update_cycle<T: Send + Sync + 'static>(inner: &Arc<ComputedStateInner<T>>) {
    let weak = Arc::downgrade(inner);
    let dispose = inner.dispose.clone();
    let delayer = inner.delayer.clone();
    tokio::spawn(async move {
        // Consecutive updates that failed without producing an output.
        let mut failures = 0u32;
        loop {
            let Some(current) = weak.upgrade().map(|inner| inner.core.current()) else {
                break;
            };
            tokio::select! {
                _ = current.when_invalidated() => {}
                _ = dispose.cancelled() => break,
            }
            drop(current);

            let Some(error_count) = weak.upgrade().map(|inner| inner.core.snapshot().error_count)
            else {
                break;
            };
            delayer
                .delay(error_count.saturating_add(failures), &dispose)
                .await;
            if dispose.is_cancelled() {
                break;
            }
            let Some(inner) = weak.upgrade() else {
                break;
            };
            match inner.update().await {
                Ok(_) => failures = 0,
                Err(err) => {
                    failures = failures.saturating_add(1);
                    tracing::warn!(key = ?inner.core.key(), error = %err, "state update failed");
                }
            }
        }
        tracing::trace!("state update cycle stopped");
    });
}
