use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::key::CacheKey;

static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

/// Version identifies one generation of a computed value.
///
/// Versions come from a single process-wide counter, so two distinct computeds never share a
/// version even when they live under different keys. Note that versions do not increase one by
/// one for a given key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version(pub u64);

impl Version {
    /// Allocate a fresh version.
    pub fn next() -> Self {
        Version(NEXT_VERSION.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Pointer is a pair of cache key and [`Version`].
///
/// Backward edges are stored as pointers: a dependant is invalidated through an edge only while
/// the registry still resolves `key` to a computed carrying exactly `version`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pointer {
    /// Key of the dependant.
    pub key: CacheKey,
    /// Version of the dependant at the moment the edge was recorded.
    pub version: Version,
}

impl Pointer {
    /// Returns true if `version` is the generation this pointer was recorded for.
    pub fn points_to(&self, version: Version) -> bool {
        self.version == version
    }
}
