//! Cached compute methods.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::computed::{AnyValue, Computed, ComputedCell, Renewer};
use crate::context::ComputeContext;
use crate::error::ComputeError;
use crate::key::{CacheKey, Cachable, OwnerId};
use crate::registry::Registry;
use crate::tracer::ComputeOutcome;

/// Caching options of a compute method.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputedOptions {
    /// How long a produced or reused computed is kept alive even if nobody references it.
    pub min_cache_duration: Duration,
    /// Delay after which an output holding a transport error is invalidated.
    pub transient_error_invalidation_delay: Duration,
    /// If set, every output is invalidated this long after it is produced.
    pub auto_invalidation_delay: Option<Duration>,
}

impl Default for ComputedOptions {
    fn default() -> Self {
        Self {
            min_cache_duration: Duration::from_secs(10),
            transient_error_invalidation_delay: Duration::from_secs(1),
            auto_invalidation_delay: None,
        }
    }
}

pub(crate) type Body<A, T> =
    dyn Fn(A, ComputeContext) -> BoxFuture<'static, anyhow::Result<Arc<T>>> + Send + Sync;

struct FunctionInner<A, T> {
    registry: Registry,
    owner: OwnerId,
    method: Arc<str>,
    options: ComputedOptions,
    body: Box<Body<A, T>>,
}

/// A memoized async method: `(owner, method, args)` maps to at most one live [`Computed`].
///
/// Concurrent invocations with equal arguments run the body once. The body receives a
/// [`ComputeContext`]; every computed read through it becomes a dependency, and invalidating a
/// dependency invalidates the result.
///
/// ```ignore
/// let get_user = ComputeFunction::new(&registry, "get_user", move |id: u32, ctx| {
///     let users = users.clone();
///     async move { Ok(users.use_in(&ctx)?.get(&id).cloned()) }
/// });
/// let user = get_user.call(1, &ComputeContext::none()).await?;
/// ```
pub struct ComputeFunction<A, T> {
    inner: Arc<FunctionInner<A, T>>,
}

impl<A, T> Clone for ComputeFunction<A, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A, T> fmt::Debug for ComputeFunction<A, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeFunction")
            .field("owner", &self.inner.owner)
            .field("method", &self.inner.method)
            .finish()
    }
}

/// Builder for [`ComputeFunction`].
pub struct ComputeFunctionBuilder<A, T> {
    registry: Registry,
    method: Arc<str>,
    owner: Option<OwnerId>,
    options: ComputedOptions,
    _marker: PhantomData<fn(A) -> T>,
}

impl<A: Cachable, T: Send + Sync + 'static> ComputeFunctionBuilder<A, T> {
    /// Share cache identity with other methods of `owner`. A fresh owner is used by default.
    pub fn owner(mut self, owner: OwnerId) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Set the caching options.
    pub fn options(mut self, options: ComputedOptions) -> Self {
        self.options = options;
        self
    }

    /// Build the function around `body`.
    pub fn build<F, Fut>(self, body: F) -> ComputeFunction<A, T>
    where
        F: Fn(A, ComputeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.build_shared(Box::new(move |args, ctx| {
            body(args, ctx).map(|result| result.map(Arc::new)).boxed()
        }))
    }

    pub(crate) fn build_shared(self, body: Box<Body<A, T>>) -> ComputeFunction<A, T> {
        ComputeFunction {
            inner: Arc::new(FunctionInner {
                registry: self.registry,
                owner: self.owner.unwrap_or_else(OwnerId::next),
                method: self.method,
                options: self.options,
                body,
            }),
        }
    }
}

/// Cancels the computing cell unless disarmed, so a dropped computation leaves nothing behind.
pub(crate) struct CancelOnDrop(Option<Arc<ComputedCell>>);

impl CancelOnDrop {
    pub(crate) fn new(cell: Arc<ComputedCell>) -> Self {
        Self(Some(cell))
    }

    pub(crate) fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(cell) = self.0.take() {
            cell.cancel();
        }
    }
}

impl<A: Cachable, T: Send + Sync + 'static> ComputeFunction<A, T> {
    /// Create a function with default options.
    pub fn new<F, Fut>(registry: &Registry, method: impl Into<Arc<str>>, body: F) -> Self
    where
        F: Fn(A, ComputeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self::builder(registry, method).build(body)
    }

    /// Start building a function.
    pub fn builder(
        registry: &Registry,
        method: impl Into<Arc<str>>,
    ) -> ComputeFunctionBuilder<A, T> {
        ComputeFunctionBuilder {
            registry: registry.clone(),
            method: method.into(),
            owner: None,
            options: ComputedOptions::default(),
            _marker: PhantomData,
        }
    }

    /// The owner identity.
    pub fn owner(&self) -> OwnerId {
        self.inner.owner
    }

    /// The method name.
    pub fn method(&self) -> &str {
        &self.inner.method
    }

    /// The registry this function caches into.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// The caching options.
    pub fn options(&self) -> &ComputedOptions {
        &self.inner.options
    }

    /// The cache key of an invocation.
    pub fn key(&self, args: &A) -> CacheKey {
        CacheKey::method(self.inner.owner, self.inner.method.clone(), args.clone())
    }

    /// The live computed for `args`, if any. Never computes.
    pub fn existing(&self, args: &A) -> Option<Computed<T>> {
        self.inner.registry.get(&self.key(args)).map(Computed::from_cell)
    }

    /// Invalidate the cached computed for `args`. Returns false if nothing was cached.
    pub fn invalidate(&self, args: &A) -> bool {
        match self.inner.registry.get(&self.key(args)) {
            Some(cell) => {
                cell.invalidate();
                true
            }
            None => false,
        }
    }

    /// Return a consistent computed for `args`, computing it if needed.
    ///
    /// The result is captured as a dependency of the computation behind `ctx`. Inside an
    /// invalidation scope nothing is computed: the cached computed is invalidated and returned,
    /// or a detached invalidated computed without output if nothing was cached.
    pub async fn invoke(&self, args: A, ctx: &ComputeContext) -> Result<Computed<T>, ComputeError> {
        let key = self.key(&args);
        let registry = &self.inner.registry;

        if ctx.is_invalidating() {
            let cell = match registry.get(&key) {
                Some(cell) => {
                    cell.invalidate();
                    cell
                }
                None => ComputedCell::detached_invalidated(key),
            };
            return Ok(Computed::from_cell(cell));
        }

        if let Some(computed) = self.reuse(&key, ctx) {
            return Ok(computed);
        }
        if let Some(path) = ctx.cycle_path(&key) {
            return Err(ComputeError::Cycle { path });
        }

        let lock = registry.locks().lock(key.clone()).await;
        if let Some(computed) = self.reuse(&key, ctx) {
            return Ok(computed);
        }
        let cell = self.compute(key, args, ctx).await?;
        drop(lock);

        ctx.capture(&cell);
        Ok(Computed::from_cell(cell))
    }

    /// Like [`ComputeFunction::invoke`], but returns the value.
    pub async fn call(&self, args: A, ctx: &ComputeContext) -> Result<Arc<T>, ComputeError> {
        self.invoke(args, ctx).await?.value()
    }

    fn reuse(&self, key: &CacheKey, ctx: &ComputeContext) -> Option<Computed<T>> {
        let registry = &self.inner.registry;
        let cell = registry.get(key)?;
        if !cell.is_consistent() {
            return None;
        }
        registry.tracer().on_cache_hit(key, cell.version());
        registry.keep_alive(&cell, self.inner.options.min_cache_duration);
        ctx.capture(&cell);
        Some(Computed::from_cell(cell))
    }

    async fn compute(
        &self,
        key: CacheKey,
        args: A,
        ctx: &ComputeContext,
    ) -> Result<Arc<ComputedCell>, ComputeError> {
        let registry = &self.inner.registry;
        let options = &self.inner.options;
        let cell = ComputedCell::computing(key, registry, Some(self.renewer(&args)));
        registry.register(&cell);
        registry.tracer().on_compute_start(cell.key());

        let child = ctx.child(cell.clone());
        let mut guard = CancelOnDrop::new(cell.clone());
        let result = (self.inner.body)(args, child.clone()).await;
        guard.disarm();
        let dependencies = child.take_dependencies();

        let invalidate_after = match result {
            Ok(value) => {
                cell.set_output(Ok(value as AnyValue), dependencies)?;
                registry
                    .tracer()
                    .on_compute_end(cell.key(), cell.version(), ComputeOutcome::Value);
                options.auto_invalidation_delay
            }
            Err(err) => {
                let err = ComputeError::from(err);
                if err.is_system() {
                    cell.cancel();
                    registry.tracer().on_compute_end(
                        cell.key(),
                        cell.version(),
                        ComputeOutcome::Discarded {
                            message: err.to_string(),
                        },
                    );
                    return Err(err);
                }
                let transient = matches!(err, ComputeError::Transport(_));
                let message = err.to_string();
                cell.set_output(Err(err), dependencies)?;
                registry.tracer().on_compute_end(
                    cell.key(),
                    cell.version(),
                    ComputeOutcome::Error { message },
                );
                if transient {
                    Some(options.transient_error_invalidation_delay)
                } else {
                    options.auto_invalidation_delay
                }
            }
        };
        if let Some(delay) = invalidate_after {
            cell.invalidate_after(delay);
        }
        registry.keep_alive(&cell, options.min_cache_duration);
        Ok(cell)
    }

    fn renewer(&self, args: &A) -> Renewer {
        let function = self.clone();
        let args = args.clone();
        Arc::new(move || {
            let function = function.clone();
            let args = args.clone();
            async move {
                let computed = function.invoke(args, &ComputeContext::none()).await?;
                Ok(computed.cell().clone())
            }
            .boxed()
        })
    }
}
