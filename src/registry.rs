use std::fmt;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use papaya::{Compute, HashMap, Operation};
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;

use crate::computed::ComputedCell;
use crate::key::{CacheKey, FastMap};
use crate::tracer::{NoopTracer, Tracer};

const KEEP_ALIVE_SWEEP_PERIOD: Duration = Duration::from_secs(1);

pub(crate) struct RegistryInner {
    entries: HashMap<CacheKey, Weak<ComputedCell>, ahash::RandomState>,
    keep_alive: KeepAlive,
    locks: AsyncLockSet,
    tracer: Box<dyn Tracer>,
}

/// Registry is the process-wide cache of live computeds, keyed by [`CacheKey`].
///
/// Entries are weak: the registry never keeps a computed alive by itself, except for the
/// keep-alive window each computed gets after it is produced or reused.
///
/// This is cheap to clone, so you can pass it around by just cloning it.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

#[derive(Clone)]
pub(crate) struct WeakRegistry(Weak<RegistryInner>);

impl WeakRegistry {
    pub(crate) fn detached() -> Self {
        WeakRegistry(Weak::new())
    }

    pub(crate) fn upgrade(&self) -> Option<Registry> {
        self.0.upgrade().map(|inner| Registry { inner })
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[test]
fn test_send_sync() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}
    assert_send::<Registry>();
    assert_sync::<Registry>();
}

impl Registry {
    /// Create a new registry.
    pub fn new() -> Self {
        Self::with_tracer(NoopTracer)
    }

    /// Create a new registry that reports to `tracer`.
    pub fn with_tracer(tracer: impl Tracer) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                entries: HashMap::default(),
                keep_alive: KeepAlive::default(),
                locks: AsyncLockSet::default(),
                tracer: Box::new(tracer),
            }),
        }
    }

    /// The shared default registry.
    pub fn global() -> &'static Registry {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();
        GLOBAL.get_or_init(Registry::new)
    }

    pub(crate) fn downgrade(&self) -> WeakRegistry {
        WeakRegistry(Arc::downgrade(&self.inner))
    }

    pub(crate) fn tracer(&self) -> &dyn Tracer {
        &*self.inner.tracer
    }

    pub(crate) fn locks(&self) -> &AsyncLockSet {
        &self.inner.locks
    }

    /// Look up the live computed under `key`. A dead entry is pruned and reads as a miss.
    pub(crate) fn get(&self, key: &CacheKey) -> Option<Arc<ComputedCell>> {
        let pinned = self.inner.entries.pin();
        let weak = pinned.get(key)?;
        if let Some(cell) = weak.upgrade() {
            return Some(cell);
        }
        pinned.compute(key.clone(), |entry| match entry {
            Some((_, weak)) if weak.strong_count() == 0 => Operation::Remove,
            _ => Operation::Abort(()),
        });
        None
    }

    /// Make `cell` the entry for its key.
    ///
    /// A different live computed previously registered under the same key is displaced and
    /// invalidated.
    pub(crate) fn register(&self, cell: &Arc<ComputedCell>) {
        if let Some(displaced) = self.replace(cell) {
            tracing::trace!(key = ?cell.key(), version = %displaced.version(), "displacing previous generation");
            displaced.invalidate();
        }
    }

    /// Make `cell` the entry for its key and return the live computed it displaced, if any.
    pub(crate) fn replace(&self, cell: &Arc<ComputedCell>) -> Option<Arc<ComputedCell>> {
        let weak = Arc::downgrade(cell);
        let pinned = self.inner.entries.pin();
        let result = pinned.compute(cell.key().clone(), |entry| match entry {
            Some((_, existing)) if existing.ptr_eq(&weak) => Operation::Abort(()),
            _ => Operation::Insert(weak.clone()),
        });
        match result {
            Compute::Updated { old: (_, old), .. } => old.upgrade(),
            Compute::Inserted(_, _) | Compute::Aborted(_) => None,
            Compute::Removed(_, _) => unreachable!(),
        }
    }

    /// Remove the entry for `cell`'s key if it still points to `cell` (or to nothing alive).
    pub(crate) fn unregister(&self, cell: &Arc<ComputedCell>) -> bool {
        let weak = Arc::downgrade(cell);
        let pinned = self.inner.entries.pin();
        let result = pinned.compute(cell.key().clone(), |entry| match entry {
            Some((_, existing)) if existing.ptr_eq(&weak) || existing.strong_count() == 0 => {
                Operation::Remove
            }
            _ => Operation::Abort(()),
        });
        let removed = matches!(result, Compute::Removed(_, _));
        drop(pinned);
        self.inner.keep_alive.release(cell);
        removed
    }

    /// Keep `cell` alive for at least `duration`.
    pub(crate) fn keep_alive(&self, cell: &Arc<ComputedCell>, duration: Duration) {
        self.inner.keep_alive.touch(cell, duration);
    }

    /// Returns true if a live computed is registered under `key`.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.get(key).is_some()
    }

    /// Number of registered entries, including dead ones not pruned yet.
    pub fn len(&self) -> usize {
        self.inner.entries.pin().len()
    }

    /// Returns true if the registry has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove dead entries and expired keep-alive pins. Returns the number of removed entries.
    pub fn prune(&self) -> usize {
        self.inner.keep_alive.sweep(Instant::now());
        let pinned = self.inner.entries.pin();
        let dead: Vec<CacheKey> = pinned
            .iter()
            .filter(|(_, weak)| weak.strong_count() == 0)
            .map(|(key, _)| key.clone())
            .collect();
        let mut removed = 0;
        for key in dead {
            let result = pinned.compute(key, |entry| match entry {
                Some((_, weak)) if weak.strong_count() == 0 => Operation::Remove,
                _ => Operation::Abort(()),
            });
            if matches!(result, Compute::Removed(_, _)) {
                removed += 1;
            }
        }
        removed
    }

    /// Invalidate every live computed.
    pub fn invalidate_all(&self) {
        let cells: Vec<Arc<ComputedCell>> = self
            .inner
            .entries
            .pin()
            .iter()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect();
        tracing::debug!(count = cells.len(), "invalidating everything");
        for cell in cells {
            cell.invalidate();
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").field("len", &self.len()).finish()
    }
}

struct KeptCell {
    cell: Arc<ComputedCell>,
    until: Instant,
}

#[derive(Default)]
struct KeepAliveState {
    cells: FastMap<CacheKey, KeptCell>,
    next_sweep: Option<Instant>,
}

/// Strong references pinning recently used computeds.
#[derive(Default)]
struct KeepAlive {
    state: Mutex<KeepAliveState>,
}

impl KeepAlive {
    fn touch(&self, cell: &Arc<ComputedCell>, duration: Duration) {
        if duration.is_zero() || !cell.is_consistent() {
            return;
        }
        let now = Instant::now();
        let until = now + duration;
        let expired = {
            let mut state = self.state.lock();
            let replaced = match state.cells.get_mut(cell.key()) {
                Some(kept) if Arc::ptr_eq(&kept.cell, cell) => {
                    kept.until = kept.until.max(until);
                    None
                }
                _ => state.cells.insert(
                    cell.key().clone(),
                    KeptCell {
                        cell: cell.clone(),
                        until,
                    },
                ),
            };
            let mut expired = Self::sweep_locked(&mut state, now);
            expired.extend(replaced);
            expired
        };
        drop(expired);
    }

    fn release(&self, cell: &Arc<ComputedCell>) {
        let removed = {
            let mut state = self.state.lock();
            match state.cells.get(cell.key()) {
                Some(kept) if Arc::ptr_eq(&kept.cell, cell) => state.cells.remove(cell.key()),
                _ => None,
            }
        };
        drop(removed);
    }

    fn sweep(&self, now: Instant) {
        let expired = {
            let mut state = self.state.lock();
            state.next_sweep = None;
            Self::sweep_locked(&mut state, now)
        };
        drop(expired);
    }

    /// Returns the removed entries so they are dropped outside the lock.
    fn sweep_locked(state: &mut KeepAliveState, now: Instant) -> Vec<KeptCell> {
        if state.next_sweep.is_some_and(|at| now < at) {
            return Vec::new();
        }
        state.next_sweep = Some(now + KEEP_ALIVE_SWEEP_PERIOD);
        let stale: Vec<CacheKey> = state
            .cells
            .iter()
            .filter(|(_, kept)| kept.until <= now || !kept.cell.is_consistent())
            .map(|(key, _)| key.clone())
            .collect();
        stale
            .into_iter()
            .filter_map(|key| state.cells.remove(&key))
            .collect()
    }
}

struct LockEntry {
    lock: Arc<AsyncMutex<()>>,
    users: usize,
}

/// Per-key async mutexes. An entry exists only while somebody holds or waits for it.
#[derive(Default)]
pub(crate) struct AsyncLockSet {
    locks: Mutex<FastMap<CacheKey, LockEntry>>,
}

/// Guard of one key of an [`AsyncLockSet`].
pub(crate) struct KeyLockGuard<'a> {
    // Declared first: released before the user count drops.
    _guard: OwnedMutexGuard<()>,
    _user: LockUser<'a>,
}

struct LockUser<'a> {
    set: &'a AsyncLockSet,
    key: CacheKey,
}

impl Drop for LockUser<'_> {
    fn drop(&mut self) {
        let mut locks = self.set.locks.lock();
        if let Some(entry) = locks.get_mut(&self.key) {
            entry.users -= 1;
            if entry.users == 0 {
                locks.remove(&self.key);
            }
        }
    }
}

impl AsyncLockSet {
    pub(crate) async fn lock(&self, key: CacheKey) -> KeyLockGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock();
            let entry = locks.entry(key.clone()).or_insert_with(|| LockEntry {
                lock: Arc::new(AsyncMutex::new(())),
                users: 0,
            });
            entry.users += 1;
            entry.lock.clone()
        };
        // Counted before waiting, so a cancelled wait still releases its slot.
        let user = LockUser { set: self, key };
        let guard = lock.lock_owned().await;
        KeyLockGuard {
            _guard: guard,
            _user: user,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::computed::AnyValue;
    use crate::key::StateId;

    fn consistent(registry: &Registry, key: CacheKey) -> Arc<ComputedCell> {
        let cell = ComputedCell::consistent(key, registry, Ok(Arc::new(()) as AnyValue), None);
        registry.register(&cell);
        cell
    }

    #[test]
    fn dead_entries_read_as_misses() {
        let registry = Registry::new();
        let key = CacheKey::state(StateId::next());
        let cell = consistent(&registry, key.clone());
        assert!(registry.contains(&key));
        drop(cell);
        assert!(registry.get(&key).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn register_displaces_and_invalidates() {
        let registry = Registry::new();
        let key = CacheKey::state(StateId::next());
        let first = consistent(&registry, key.clone());
        let second = consistent(&registry, key.clone());
        assert!(!first.is_consistent());
        assert!(second.is_consistent());
        assert!(Arc::ptr_eq(&registry.get(&key).unwrap(), &second));
    }

    #[test]
    fn unregister_only_removes_own_entry() {
        let registry = Registry::new();
        let key = CacheKey::state(StateId::next());
        let first = consistent(&registry, key.clone());
        let second = consistent(&registry, key.clone());
        assert!(!registry.unregister(&first));
        assert!(registry.contains(&key));
        assert!(registry.unregister(&second));
        assert!(!registry.contains(&key));
    }

    #[test]
    fn prune_removes_dead_entries() {
        let registry = Registry::new();
        let keep = consistent(&registry, CacheKey::state(StateId::next()));
        for _ in 0..3 {
            consistent(&registry, CacheKey::state(StateId::next()));
        }
        assert_eq!(registry.len(), 4);
        assert_eq!(registry.prune(), 3);
        assert_eq!(registry.len(), 1);
        drop(keep);
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_pins_until_expiry() {
        let registry = Registry::new();
        let key = CacheKey::state(StateId::next());
        let cell = consistent(&registry, key.clone());
        registry.keep_alive(&cell, Duration::from_secs(5));
        drop(cell);
        assert!(registry.contains(&key));

        tokio::time::advance(Duration::from_secs(6)).await;
        registry.prune();
        assert!(!registry.contains(&key));
    }

    #[test]
    fn invalidate_all_flips_every_entry() {
        let registry = Registry::new();
        let a = consistent(&registry, CacheKey::state(StateId::next()));
        let b = consistent(&registry, CacheKey::state(StateId::next()));
        registry.invalidate_all();
        assert!(!a.is_consistent());
        assert!(!b.is_consistent());
    }

    #[tokio::test]
    async fn lock_set_serializes_and_cleans_up() {
        let set = AsyncLockSet::default();
        let key = CacheKey::state(StateId::next());
        let guard = set.lock(key.clone()).await;
        assert_eq!(set.len(), 1);
        let pending = tokio::time::timeout(Duration::from_millis(10), set.lock(key.clone())).await;
        assert!(pending.is_err());
        // The timed out waiter released its slot.
        assert_eq!(set.len(), 1);
        drop(guard);
        assert_eq!(set.len(), 0);
        let _again = set.lock(key).await;
        assert_eq!(set.len(), 1);
    }
}
