//! Computed-Flow: memoized async computations with automatic dependency tracking and
//! invalidation that crosses process boundaries.
//!
//! # Key Features
//!
//! - **Memoized compute methods**: a [`ComputeFunction`] caches one [`Computed`] per argument
//!   set and runs concurrent invocations with equal arguments once
//! - **Automatic dependency capture**: every computed read through a [`ComputeContext`]
//!   becomes a dependency; invalidating it invalidates everything built on top
//! - **Versioned edges**: recomputed values get a new [`Version`], so stale backward edges
//!   never invalidate newer results
//! - **States**: [`MutableState`] holds a settable value, [`ComputedState`] keeps a computation
//!   up to date in the background, throttled by an [`UpdateDelayer`]
//! - **Remote computeds**: an [`RpcHub`] serves compute methods to other hubs; remote results
//!   are invalidated when the server-side result is, and survive reconnects and reroutes
//!
//! # Example
//!
//! ```ignore
//! use computed_flow::{ComputeContext, ComputeFunction, MutableState, Registry};
//!
//! let registry = Registry::new();
//! let x = MutableState::new(&registry, 10);
//! let doubled = ComputeFunction::new(&registry, "doubled", {
//!     let x = x.clone();
//!     move |(): (), ctx: ComputeContext| {
//!         let x = x.clone();
//!         async move { Ok(*x.use_in(&ctx)? * 2) }
//!     }
//! });
//!
//! assert_eq!(*doubled.call((), &ComputeContext::none()).await?, 20);
//! x.set(50);
//! assert_eq!(*doubled.call((), &ComputeContext::none()).await?, 100);
//! ```
//!
//! # Invalidation
//!
//! [`Computed::invalidate`] invalidates one computed and, transitively, its dependants.
//! Calling a compute method inside [`ComputeContext::begin_invalidation`] invalidates the cached
//! result for those arguments without computing anything.

mod computed;
mod context;
mod error;
mod function;
mod key;
mod registry;
mod retry;
pub mod rpc;
mod signal;
pub mod state;
pub mod tracer;
mod version;

pub use computed::{Computed, ConsistencyState};
pub use context::ComputeContext;
pub use error::{
    ComputeError, ComputeResultExt, ProtocolError, RemoteError, TransportError, TypedErr,
};
pub use function::{ComputeFunction, ComputeFunctionBuilder, ComputedOptions};
pub use key::{ArgsKey, CacheKey, Cachable, DynEq, MethodKey, OwnerId, StateId};
pub use registry::Registry;
pub use retry::RetryDelays;
pub use rpc::{RpcHub, RpcOptions};
pub use signal::{CancelToken, HandlerKey, Handlers};
pub use state::{
    ComputedState, ComputedStateOptions, FixedDelayer, MutableState, StateSnapshot,
    UiActionTracker, UiUpdateDelayer, UpdateDelayer,
};
pub use tracer::{ComputeOutcome, LogTracer, NoopTracer, Tracer};
pub use version::{Pointer, Version};
