//! Versioned computed values and the invalidation cascade.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, Stream};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::context::ComputeContext;
use crate::error::{ComputeError, ProtocolError};
use crate::key::{CacheKey, FastMap};
use crate::registry::{Registry, WeakRegistry};
use crate::signal::{HandlerKey, OnceHandlers};
use crate::version::{Pointer, Version};

pub(crate) type AnyValue = Arc<dyn Any + Send + Sync>;
pub(crate) type Output = Result<AnyValue, ComputeError>;
pub(crate) type Renewer =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<ComputedCell>, ComputeError>> + Send + Sync>;

/// Lifecycle state of a computed.
///
/// Transitions are one-way: `Computing -> Consistent -> Invalidated`, or
/// `Computing -> Invalidated` on cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsistencyState {
    /// The value is being produced.
    Computing,
    /// The value is up to date.
    Consistent,
    /// The value is stale. Terminal.
    Invalidated,
}

struct CellInner {
    state: ConsistencyState,
    output: Option<Output>,
    dependencies: Vec<Arc<ComputedCell>>,
    dependants: FastMap<CacheKey, Version>,
    invalidate_on_commit: bool,
    handlers: OnceHandlers,
}

/// Untyped computed. [`Computed<T>`] is the typed handle over it.
pub(crate) struct ComputedCell {
    key: CacheKey,
    version: Version,
    registry: WeakRegistry,
    renewer: Option<Renewer>,
    inner: Mutex<CellInner>,
    invalidated: Notify,
}

struct Flipped {
    dependants: Vec<Pointer>,
    handlers: Vec<Box<dyn FnOnce() + Send>>,
}

impl ComputedCell {
    fn with_state(
        key: CacheKey,
        registry: WeakRegistry,
        renewer: Option<Renewer>,
        state: ConsistencyState,
        output: Option<Output>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            version: Version::next(),
            registry,
            renewer,
            inner: Mutex::new(CellInner {
                state,
                output,
                dependencies: Vec::new(),
                dependants: Default::default(),
                invalidate_on_commit: false,
                handlers: OnceHandlers::new(),
            }),
            invalidated: Notify::new(),
        })
    }

    /// A new computed in `Computing` state. Not registered yet.
    pub(crate) fn computing(
        key: CacheKey,
        registry: &Registry,
        renewer: Option<Renewer>,
    ) -> Arc<Self> {
        Self::with_state(
            key,
            registry.downgrade(),
            renewer,
            ConsistencyState::Computing,
            None,
        )
    }

    /// A new computed that is consistent from the start. Not registered yet.
    pub(crate) fn consistent(
        key: CacheKey,
        registry: &Registry,
        output: Output,
        renewer: Option<Renewer>,
    ) -> Arc<Self> {
        Self::with_state(
            key,
            registry.downgrade(),
            renewer,
            ConsistencyState::Consistent,
            Some(output),
        )
    }

    /// An invalidated computed without output that belongs to no registry.
    pub(crate) fn detached_invalidated(key: CacheKey) -> Arc<Self> {
        Self::with_state(
            key,
            WeakRegistry::detached(),
            None,
            ConsistencyState::Invalidated,
            None,
        )
    }

    pub(crate) fn key(&self) -> &CacheKey {
        &self.key
    }

    pub(crate) fn version(&self) -> Version {
        self.version
    }

    pub(crate) fn registry(&self) -> Option<Registry> {
        self.registry.upgrade()
    }

    pub(crate) fn state(&self) -> ConsistencyState {
        self.inner.lock().state
    }

    pub(crate) fn is_consistent(&self) -> bool {
        self.state() == ConsistencyState::Consistent
    }

    pub(crate) fn is_computing(&self) -> bool {
        self.state() == ConsistencyState::Computing
    }

    /// The output, if any. Always `None` while computing.
    pub(crate) fn output(&self) -> Option<Output> {
        self.inner.lock().output.clone()
    }

    pub(crate) fn dependency_keys(&self) -> Vec<CacheKey> {
        let inner = self.inner.lock();
        inner.dependencies.iter().map(|d| d.key.clone()).collect()
    }

    pub(crate) fn dependants(&self) -> Vec<Pointer> {
        let inner = self.inner.lock();
        inner
            .dependants
            .iter()
            .map(|(key, version)| Pointer {
                key: key.clone(),
                version: *version,
            })
            .collect()
    }

    /// Commit the output and freeze the forward edges.
    pub(crate) fn set_output(
        self: &Arc<Self>,
        output: Output,
        dependencies: Vec<Arc<ComputedCell>>,
    ) -> Result<(), ProtocolError> {
        let invalidate_now = {
            let mut inner = self.inner.lock();
            if inner.state != ConsistencyState::Computing {
                return Err(ProtocolError::OutputAlreadySet {
                    key: self.key.debug_repr(),
                });
            }
            inner.output = Some(output);
            inner.dependencies = dependencies;
            inner.state = ConsistencyState::Consistent;
            mem::take(&mut inner.invalidate_on_commit)
        };
        if invalidate_now {
            tracing::debug!(key = ?self.key, "invalidated while computing");
            self.invalidate();
        }
        Ok(())
    }

    /// Abandon a computation: no output, evicted from the registry.
    pub(crate) fn cancel(self: &Arc<Self>) {
        let (dependants, handlers) = {
            let mut inner = self.inner.lock();
            if inner.state != ConsistencyState::Computing {
                return;
            }
            inner.state = ConsistencyState::Invalidated;
            inner.output = None;
            inner.invalidate_on_commit = false;
            (mem::take(&mut inner.dependants), inner.handlers.take())
        };
        drop(dependants);
        self.invalidated.notify_waiters();
        if let Some(registry) = self.registry() {
            registry.unregister(self);
        }
        tracing::debug!(key = ?self.key, version = %self.version, "computation cancelled");
        for handler in handlers {
            handler();
        }
    }

    /// Flip this computed to invalidated and cascade through its dependants.
    ///
    /// Idempotent. A computing computed is only marked, and gets invalidated right after it
    /// commits.
    pub(crate) fn invalidate(self: &Arc<Self>) {
        let mut pending = vec![self.clone()];
        let mut handlers = Vec::new();
        let mut flipped_count = 0usize;
        while let Some(cell) = pending.pop() {
            let Some(flipped) = cell.flip() else {
                continue;
            };
            flipped_count += 1;
            handlers.extend(flipped.handlers);
            let Some(registry) = cell.registry() else {
                continue;
            };
            for pointer in flipped.dependants {
                let Some(dependant) = registry.get(&pointer.key) else {
                    continue;
                };
                if pointer.points_to(dependant.version) {
                    pending.push(dependant);
                } else {
                    tracing::trace!(key = ?pointer.key, "skipping edge to a superseded generation");
                }
            }
        }
        if flipped_count > 1 {
            tracing::debug!(key = ?self.key, count = flipped_count, "invalidation cascaded");
        }
        for handler in handlers {
            handler();
        }
    }

    fn flip(self: &Arc<Self>) -> Option<Flipped> {
        let (dependants, handlers, dependencies) = {
            let mut inner = self.inner.lock();
            match inner.state {
                ConsistencyState::Invalidated => return None,
                ConsistencyState::Computing => {
                    inner.invalidate_on_commit = true;
                    return None;
                }
                ConsistencyState::Consistent => {}
            }
            inner.state = ConsistencyState::Invalidated;
            (
                mem::take(&mut inner.dependants),
                inner.handlers.take(),
                mem::take(&mut inner.dependencies),
            )
        };
        drop(dependencies);
        self.invalidated.notify_waiters();
        if let Some(registry) = self.registry() {
            registry.tracer().on_invalidated(&self.key, self.version);
            registry.unregister(self);
        }
        Some(Flipped {
            dependants: dependants
                .into_iter()
                .map(|(key, version)| Pointer { key, version })
                .collect(),
            handlers,
        })
    }

    /// Record that `dependant` (at `version`) used this computed.
    ///
    /// Returns false, without recording anything, if this computed is already invalidated.
    pub(crate) fn attach_dependant(&self, dependant: &CacheKey, version: Version) -> bool {
        let mut inner = self.inner.lock();
        if inner.state == ConsistencyState::Invalidated {
            return false;
        }
        inner.dependants.insert(dependant.clone(), version);
        true
    }

    pub(crate) fn mark_invalidate_on_commit(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ConsistencyState::Computing {
            inner.invalidate_on_commit = true;
        }
    }

    /// Run `handler` once when this computed is invalidated, or right away if it already is.
    pub(crate) fn on_invalidated(&self, handler: Box<dyn FnOnce() + Send>) -> Option<HandlerKey> {
        let mut inner = self.inner.lock();
        if inner.state == ConsistencyState::Invalidated {
            drop(inner);
            handler();
            return None;
        }
        Some(inner.handlers.add(handler))
    }

    pub(crate) fn remove_on_invalidated(&self, key: HandlerKey) -> bool {
        self.inner.lock().handlers.remove(key)
    }

    pub(crate) async fn when_invalidated(&self) {
        loop {
            let notified = self.invalidated.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state() == ConsistencyState::Invalidated {
                return;
            }
            notified.await;
        }
    }

    pub(crate) fn renewer(&self) -> Option<Renewer> {
        self.renewer.clone()
    }

    /// Invalidate after `delay` unless the cell is gone by then.
    pub(crate) fn invalidate_after(self: &Arc<Self>, delay: Duration) {
        if delay.is_zero() {
            self.invalidate();
            return;
        }
        let cell: Weak<ComputedCell> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(cell) = cell.upgrade() {
                cell.invalidate();
            }
        });
    }
}

impl fmt::Debug for ComputedCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("key", &self.key)
            .field("version", &self.version)
            .field("state", &self.state())
            .finish()
    }
}

/// A memoized result of one computation: one version of the value stored under a key.
///
/// Cheap to clone. The value is immutable once committed; a newer value is always a new
/// `Computed` with a new [`Version`].
pub struct Computed<T> {
    cell: Arc<ComputedCell>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Computed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.cell, f)
    }
}

pub(crate) fn downcast_output<T: Send + Sync + 'static>(
    key: &CacheKey,
    output: Output,
) -> Result<Arc<T>, ComputeError> {
    let value = output?;
    value.downcast::<T>().map_err(|_| {
        ProtocolError::TypeMismatch {
            key: key.debug_repr(),
            expected: std::any::type_name::<T>(),
        }
        .into()
    })
}

impl<T: Send + Sync + 'static> Computed<T> {
    pub(crate) fn from_cell(cell: Arc<ComputedCell>) -> Self {
        Self {
            cell,
            _marker: PhantomData,
        }
    }

    pub(crate) fn cell(&self) -> &Arc<ComputedCell> {
        &self.cell
    }

    /// The cache key of this computed.
    pub fn key(&self) -> &CacheKey {
        self.cell.key()
    }

    /// The version of this computed.
    pub fn version(&self) -> Version {
        self.cell.version()
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ConsistencyState {
        self.cell.state()
    }

    /// Returns true if the value is up to date.
    pub fn is_consistent(&self) -> bool {
        self.cell.is_consistent()
    }

    /// The committed output, or `None` while computing (or after a cancellation).
    ///
    /// An invalidated computed still returns the output it had.
    pub fn output(&self) -> Option<Result<Arc<T>, ComputeError>> {
        self.cell
            .output()
            .map(|output| downcast_output(self.key(), output))
    }

    /// The committed value. A cached error is returned as `Err`.
    pub fn value(&self) -> Result<Arc<T>, ComputeError> {
        match self.output() {
            Some(output) => output,
            None => Err(ProtocolError::NoOutput {
                key: self.key().debug_repr(),
            }
            .into()),
        }
    }

    /// Read the value and record it as a dependency of the computation behind `ctx`.
    ///
    /// Never computes and never waits. Inside an invalidation scope, invalidates this computed
    /// instead of capturing it.
    pub fn use_in(&self, ctx: &ComputeContext) -> Result<Arc<T>, ComputeError> {
        if ctx.is_invalidating() {
            self.cell.invalidate();
            return self.value();
        }
        let output = self.value();
        if let Err(ComputeError::Protocol(ProtocolError::NoOutput { .. })) = &output {
            return output;
        }
        ctx.capture(&self.cell);
        output
    }

    /// Invalidate this computed and, transitively, everything that used it.
    pub fn invalidate(&self) {
        self.cell.invalidate();
    }

    /// Invalidate this computed once `delay` has passed.
    ///
    /// Only a weak reference is kept meanwhile; a computed dropped before that is left alone.
    pub fn invalidate_after(&self, delay: Duration) {
        self.cell.invalidate_after(delay);
    }

    /// Run `handler` once when this computed gets invalidated.
    ///
    /// Runs it immediately, and returns `None`, if it is already invalidated.
    pub fn on_invalidated(&self, handler: impl FnOnce() + Send + 'static) -> Option<HandlerKey> {
        self.cell.on_invalidated(Box::new(handler))
    }

    /// Remove a handler registered with [`Computed::on_invalidated`].
    pub fn remove_on_invalidated(&self, key: HandlerKey) -> bool {
        self.cell.remove_on_invalidated(key)
    }

    /// Wait until this computed is invalidated.
    pub async fn when_invalidated(&self) {
        self.cell.when_invalidated().await
    }

    /// Return an up to date computed for the same key.
    ///
    /// Returns `self` if it is still consistent, otherwise recomputes through whatever produced
    /// it.
    pub async fn update(&self) -> Result<Computed<T>, ComputeError> {
        if self.cell.is_consistent() {
            return Ok(self.clone());
        }
        let Some(renewer) = self.cell.renewer() else {
            return Err(ProtocolError::NotRenewable {
                key: self.key().debug_repr(),
            }
            .into());
        };
        let cell = renewer().await?;
        Ok(Computed::from_cell(cell))
    }

    /// Follow updates of this computed until its output satisfies `predicate`.
    ///
    /// Returns the first consistent computed for the same key whose output matches, which may
    /// be an updated `self`.
    pub async fn when(
        &self,
        mut predicate: impl FnMut(&Result<Arc<T>, ComputeError>) -> bool,
    ) -> Result<Computed<T>, ComputeError> {
        let mut computed = self.update().await?;
        loop {
            if predicate(&computed.value()) {
                return Ok(computed);
            }
            computed.when_invalidated().await;
            computed = computed.update().await?;
        }
    }

    /// Successive consistent computeds for this key, starting with an up to date one.
    ///
    /// The next item is produced once the previous one is invalidated and updated. The stream
    /// ends after yielding a failed update.
    pub fn changes(
        &self,
    ) -> impl Stream<Item = Result<Computed<T>, ComputeError>> + Send + 'static {
        stream::unfold(Some((self.clone(), true)), |state| async move {
            let Some((computed, first)) = state else {
                return None;
            };
            if !first {
                computed.when_invalidated().await;
            }
            match computed.update().await {
                Ok(next) => Some((Ok(next.clone()), Some((next, false)))),
                Err(err) => Some((Err(err), None)),
            }
        })
    }

    /// Keys this computed used while computing. Empty while computing or once invalidated.
    pub fn dependencies(&self) -> Vec<CacheKey> {
        self.cell.dependency_keys()
    }

    /// Backward edges to computeds that used this one.
    pub fn dependants(&self) -> Vec<Pointer> {
        self.cell.dependants()
    }
}
