//! The ambient "current computation" passed through user code.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::computed::ComputedCell;
use crate::key::CacheKey;

tokio::task_local! {
    static CURRENT: ComputeContext;
}

struct Frame {
    computed: Arc<ComputedCell>,
    parent: Option<Arc<Frame>>,
    captured: Mutex<Vec<Arc<ComputedCell>>>,
}

#[derive(Clone, Default)]
enum Mode {
    #[default]
    None,
    Invalidating,
    Computing(Arc<Frame>),
}

/// Describes what the caller is doing when it reads a computed.
///
/// - [`ComputeContext::none`]: plain read, nothing is captured.
/// - computing: handed to a computation body; every computed read through it becomes a
///   dependency of the computation.
/// - [`ComputeContext::begin_invalidation`]: reads invalidate instead of computing.
///
/// Contexts are passed explicitly. [`ComputeContext::run`] and [`ComputeContext::current`]
/// additionally make one available to code that cannot take it as an argument.
#[derive(Clone, Default)]
pub struct ComputeContext {
    mode: Mode,
}

impl ComputeContext {
    /// A context that captures nothing.
    pub fn none() -> Self {
        Self { mode: Mode::None }
    }

    /// A context whose reads invalidate the cached computed instead of computing it.
    pub fn begin_invalidation() -> Self {
        Self {
            mode: Mode::Invalidating,
        }
    }

    /// Returns true inside an invalidation scope.
    pub fn is_invalidating(&self) -> bool {
        matches!(self.mode, Mode::Invalidating)
    }

    /// Returns true if reads through this context are recorded as dependencies.
    pub fn is_capturing(&self) -> bool {
        match &self.mode {
            Mode::Computing(frame) => frame.computed.is_computing(),
            _ => false,
        }
    }

    /// Key of the computation this context belongs to.
    pub fn computed_key(&self) -> Option<&CacheKey> {
        match &self.mode {
            Mode::Computing(frame) => Some(frame.computed.key()),
            _ => None,
        }
    }

    pub(crate) fn computed(&self) -> Option<&Arc<ComputedCell>> {
        match &self.mode {
            Mode::Computing(frame) => Some(&frame.computed),
            _ => None,
        }
    }

    /// Context for a computation of `computed` started from `self`.
    pub(crate) fn child(&self, computed: Arc<ComputedCell>) -> Self {
        let parent = match &self.mode {
            Mode::Computing(frame) => Some(frame.clone()),
            _ => None,
        };
        Self {
            mode: Mode::Computing(Arc::new(Frame {
                computed,
                parent,
                captured: Mutex::new(Vec::new()),
            })),
        }
    }

    /// Record `dependency` as used by the computation behind this context.
    pub(crate) fn capture(&self, dependency: &Arc<ComputedCell>) {
        let Mode::Computing(frame) = &self.mode else {
            return;
        };
        let owner = &frame.computed;
        if !owner.is_computing() || Arc::ptr_eq(owner, dependency) {
            return;
        }
        if !dependency.attach_dependant(owner.key(), owner.version()) {
            // Used a stale value: the result will be stale too.
            owner.mark_invalidate_on_commit();
            return;
        }
        if let Some(registry) = owner.registry() {
            registry
                .tracer()
                .on_dependency_captured(owner.key(), dependency.key());
        }
        let mut captured = frame.captured.lock();
        if !captured.iter().any(|d| Arc::ptr_eq(d, dependency)) {
            captured.push(dependency.clone());
        }
    }

    /// Move the captured dependencies out.
    pub(crate) fn take_dependencies(&self) -> Vec<Arc<ComputedCell>> {
        match &self.mode {
            Mode::Computing(frame) => std::mem::take(&mut *frame.captured.lock()),
            _ => Vec::new(),
        }
    }

    /// If `key` is being computed by this context or one of its ancestors, the cycle path.
    pub(crate) fn cycle_path(&self, key: &CacheKey) -> Option<Vec<String>> {
        let Mode::Computing(frame) = &self.mode else {
            return None;
        };
        let mut chain = Vec::new();
        let mut current = Some(frame);
        while let Some(frame) = current {
            chain.push(frame.computed.key());
            if frame.computed.key() == key {
                let mut path: Vec<String> = chain.iter().rev().map(|k| k.debug_repr()).collect();
                path.push(key.debug_repr());
                return Some(path);
            }
            current = frame.parent.as_ref();
        }
        None
    }

    /// Run `future` with this context installed as [`ComputeContext::current`].
    pub async fn run<F: Future>(self, future: F) -> F::Output {
        CURRENT.scope(self, future).await
    }

    /// The context installed by the innermost [`ComputeContext::run`], or a plain context.
    pub fn current() -> Self {
        CURRENT.try_with(Clone::clone).unwrap_or_default()
    }
}

impl fmt::Debug for ComputeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.mode {
            Mode::None => f.write_str("ComputeContext::None"),
            Mode::Invalidating => f.write_str("ComputeContext::Invalidating"),
            Mode::Computing(frame) => f
                .debug_tuple("ComputeContext::Computing")
                .field(frame.computed.key())
                .finish(),
        }
    }
}
