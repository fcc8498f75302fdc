//! Key types for computed caching.

use std::any::{Any, TypeId};
use std::fmt::{self, Debug};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dyn_hash::DynHash;

/// Bound for values usable as computed arguments.
///
/// Automatically implemented for all types that implement
/// `Hash + Eq + Clone + Debug + Send + Sync + 'static`.
pub trait Cachable: Hash + Eq + Clone + Debug + Send + Sync + 'static {}

impl<T: Hash + Eq + Clone + Debug + Send + Sync + 'static> Cachable for T {}

/// Object-safe equality comparison.
///
/// This trait enables comparing two trait objects for equality
/// by downcasting and comparing the concrete types.
pub trait DynEq: Any {
    /// Returns `true` if `other` is the same concrete type and equal to `self`.
    fn dyn_eq(&self, other: &dyn Any) -> bool;
}

impl<T: Eq + 'static> DynEq for T {
    fn dyn_eq(&self, other: &dyn Any) -> bool {
        other.downcast_ref::<T>().is_some_and(|o| self == o)
    }
}

/// Type-erased argument tuple of a compute method.
///
/// Combines object-safe hashing, equality and debug formatting so that
/// `Arc<dyn ArgsKey>` can live inside hash map keys.
pub trait ArgsKey: DynHash + DynEq + Debug + Send + Sync {
    /// Get the arguments as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;
}

impl<T: Hash + Eq + Debug + Send + Sync + 'static> ArgsKey for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

// Enable Hash for dyn ArgsKey using the dyn-hash crate
dyn_hash::hash_trait_object!(ArgsKey);

pub(crate) type FastMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;

static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_STATE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of the object owning a compute method.
///
/// Two compute functions with the same method name but different owners never share cache
/// entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(pub u64);

impl OwnerId {
    /// Allocate a fresh owner identity.
    pub fn next() -> Self {
        OwnerId(NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Identity of a state object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateId(pub u64);

impl StateId {
    /// Allocate a fresh state identity.
    pub fn next() -> Self {
        StateId(NEXT_STATE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Cache key of a method invocation: `(owner, method, args)`.
#[derive(Clone)]
pub struct MethodKey {
    owner: OwnerId,
    method: Arc<str>,
    args_type: TypeId,
    args: Arc<dyn ArgsKey>,
}

impl MethodKey {
    /// Create a new method key.
    pub fn new<A: Cachable>(owner: OwnerId, method: Arc<str>, args: A) -> Self {
        Self {
            owner,
            method,
            args_type: TypeId::of::<A>(),
            args: Arc::new(args),
        }
    }

    /// The owner of the method.
    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    /// The method name.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Downcast the arguments to a concrete type.
    pub fn args<A: 'static>(&self) -> Option<&A> {
        self.args.as_any().downcast_ref::<A>()
    }
}

impl Hash for MethodKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.owner.hash(state);
        self.method.hash(state);
        self.args_type.hash(state);
        self.args.hash(state);
    }
}

impl PartialEq for MethodKey {
    fn eq(&self, other: &Self) -> bool {
        self.owner == other.owner
            && self.method == other.method
            && self.args_type == other.args_type
            && self.args.dyn_eq(other.args.as_any())
    }
}

impl Eq for MethodKey {}

impl Debug for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}{:?}", self.owner.0, self.method, self.args)
    }
}

/// Identity of a computed in the registry.
///
/// Either a method invocation or a state; state keys are what state-bound computeds register
/// under.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// A method invocation.
    Method(MethodKey),
    /// A state object.
    State(StateId),
}

impl CacheKey {
    /// Create a method key.
    pub fn method<A: Cachable>(owner: OwnerId, method: Arc<str>, args: A) -> Self {
        CacheKey::Method(MethodKey::new(owner, method, args))
    }

    /// Create a state key.
    pub fn state(id: StateId) -> Self {
        CacheKey::State(id)
    }

    /// Get the debug representation of this key.
    pub fn debug_repr(&self) -> String {
        format!("{:?}", self)
    }
}

impl Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Method(key) => Debug::fmt(key, f),
            CacheKey::State(id) => write!(f, "state#{}", id.0),
        }
    }
}
