//! Tracer trait for observing computations.
//!
//! The default [`NoopTracer`] does nothing; [`LogTracer`] forwards events to `tracing`.
//!
//! ```ignore
//! use computed_flow::{Registry, Tracer, CacheKey, Version};
//!
//! struct Counting(std::sync::atomic::AtomicUsize);
//!
//! impl Tracer for Counting {
//!     fn on_compute_start(&self, _key: &CacheKey) {
//!         self.0.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
//!     }
//! }
//!
//! let registry = Registry::with_tracer(Counting(Default::default()));
//! ```

use crate::key::CacheKey;
use crate::version::Version;

/// Outcome of a computation, as reported to [`Tracer::on_compute_end`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComputeOutcome {
    /// The computation committed a value.
    Value,
    /// The computation committed a cached error.
    Error {
        /// Display representation of the error.
        message: String,
    },
    /// The computation was discarded without an output.
    Discarded {
        /// Display representation of the reason.
        message: String,
    },
}

/// Observer of computed lifecycle events.
///
/// All methods have default empty implementations, so you only need to override
/// the events you're interested in. Implementations must be `Send + Sync` as the tracer is
/// called from any task.
pub trait Tracer: Send + Sync + 'static {
    /// A computation started for `key`.
    #[inline]
    fn on_compute_start(&self, _key: &CacheKey) {}

    /// A computation for `key` finished.
    #[inline]
    fn on_compute_end(&self, _key: &CacheKey, _version: Version, _outcome: ComputeOutcome) {}

    /// A consistent cached computed was reused.
    #[inline]
    fn on_cache_hit(&self, _key: &CacheKey, _version: Version) {}

    /// `dependant` captured `dependency` while computing.
    #[inline]
    fn on_dependency_captured(&self, _dependant: &CacheKey, _dependency: &CacheKey) {}

    /// A computed flipped to invalidated.
    #[inline]
    fn on_invalidated(&self, _key: &CacheKey, _version: Version) {}
}

/// A no-op tracer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {}

/// Tracer that logs every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTracer;

impl Tracer for LogTracer {
    fn on_compute_start(&self, key: &CacheKey) {
        tracing::debug!(?key, "compute start");
    }

    fn on_compute_end(&self, key: &CacheKey, version: Version, outcome: ComputeOutcome) {
        tracing::debug!(?key, %version, ?outcome, "compute end");
    }

    fn on_cache_hit(&self, key: &CacheKey, version: Version) {
        tracing::trace!(?key, %version, "cache hit");
    }

    fn on_dependency_captured(&self, dependant: &CacheKey, dependency: &CacheKey) {
        tracing::trace!(?dependant, ?dependency, "dependency captured");
    }

    fn on_invalidated(&self, key: &CacheKey, version: Version) {
        tracing::debug!(?key, %version, "invalidated");
    }
}
