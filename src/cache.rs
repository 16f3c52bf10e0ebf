//! Concurrent CART cache.
//!
//! The public face of the crate: [`CartCache`] wraps the single-threaded
//! CART engine in a concurrency shell and fronts a [`Loader`] that produces,
//! releases and sizes values.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                           CartCache<K, V, L>                                │
//! │                                                                             │
//! │   hit path (no policy lock)                                                 │
//! │   ┌──────────────────────────────────────────────────────────────────────┐  │
//! │   │ resident: DashMap<K, Arc<Entry>>   ── sharded, read-mostly           │  │
//! │   │   get(key) ──► set referenced bit (relaxed) ──► Handle (Arc clone)   │  │
//! │   └──────────────────────────────────────────────────────────────────────┘  │
//! │                                                                             │
//! │   miss path                                                                 │
//! │   ┌──────────────────────────────────────────────────────────────────────┐  │
//! │   │ pending: Mutex<FxHashSet<K>> + Condvar                               │  │
//! │   │   first thread claims the key, calls loader.acquire with NO lock     │  │
//! │   │   held; racers wait and then re-read the resident index              │  │
//! │   │                                                                      │  │
//! │   │ core: FairMutex<CartCore>                                            │  │
//! │   │   clock sweep, demotion, ghost trim, adaptation — one insertion      │  │
//! │   │   at a time, never across a loader call                              │  │
//! │   └──────────────────────────────────────────────────────────────────────┘  │
//! │                                                                             │
//! │   release path                                                              │
//! │   ┌──────────────────────────────────────────────────────────────────────┐  │
//! │   │ value pins = strong count of Arc<ValueCell>                          │  │
//! │   │   eviction drops the cache's reference after un-indexing; the last   │  │
//! │   │   reference (cache or handle) hands the value to loader.release      │  │
//! │   └──────────────────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Operations
//!
//! | Operation     | Locking                      | Notes                         |
//! |---------------|------------------------------|-------------------------------|
//! | `get_or_load` | none on hit; policy on miss  | One `acquire` per residency   |
//! | `peek`        | none                         | No reference-bit side effect  |
//! | `insert`      | policy                       | Existing entry wins races     |
//! | `remove`      | policy                       | No ghost left behind          |
//! | `clear`       | policy, then drains pins     | Blocks until handles drop     |
//!
//! ## Lock order
//!
//! policy lock → pending mutex → index shard; the loader is only ever called
//! with the pending slot held and no lock at all.
//!
//! ## Example Usage
//!
//! ```
//! use cartkit::cache::CartCache;
//! use cartkit::traits::Loader;
//!
//! struct Squares;
//!
//! impl Loader<u32, u64> for Squares {
//!     type Error = std::convert::Infallible;
//!     fn acquire(&self, key: &u32) -> Result<u64, Self::Error> {
//!         Ok(u64::from(*key) * u64::from(*key))
//!     }
//!     fn release(&self, _key: &u32, _value: u64) {}
//! }
//!
//! let cache = CartCache::with_capacity(Squares, 100).unwrap();
//!
//! let nine = cache.get_or_load(3).unwrap();
//! assert_eq!(*nine, 9);
//!
//! // A second lookup is a hit and pins the same value.
//! let again = cache.get_or_load(3).unwrap();
//! assert_eq!(*again, 9);
//! assert_eq!(cache.stats().hits, 1);
//! ```

use std::hash::Hash;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{Condvar, FairMutex, Mutex};
use rustc_hash::{FxBuildHasher, FxHashSet};

use crate::error::ConfigError;
use crate::handle::{Handle, Releaser, ValueCell};
use crate::policy::cart::{CartCore, Entry};
use crate::stats::{CacheStats, StatCounters};
use crate::traits::Loader;

/// Everything the cache, its handles and its release path share.
struct Shared<K, V, L> {
    loader: L,
    /// The resident index; its key set mirrors the engine's clock lists at
    /// every policy-lock release.
    resident: DashMap<K, Arc<Entry<K, V>>, FxBuildHasher>,
    /// Keys with a load in flight; per-key miss deduplication.
    pending: Mutex<FxHashSet<K>>,
    pending_cv: Condvar,
    /// Serializes all replacement-policy state.
    core: FairMutex<CartCore<K, V>>,
    stats: StatCounters,
}

impl<K, V, L> Releaser<K, V> for Shared<K, V, L>
where
    K: Send + Sync,
    V: Send + Sync,
    L: Loader<K, V> + Send + Sync,
{
    fn release(&self, key: &K, value: V) {
        self.stats.inc_release();
        self.loader.release(key, value);
    }
}

/// Removes the claimed key from the pending set on every exit path, including
/// unwinds out of the loader, and wakes the waiters.
struct LoadPermit<'a, K: Eq + Hash> {
    pending: &'a Mutex<FxHashSet<K>>,
    pending_cv: &'a Condvar,
    key: Option<K>,
}

impl<K: Eq + Hash> Drop for LoadPermit<'_, K> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.pending.lock().remove(&key);
            self.pending_cv.notify_all();
        }
    }
}

/// A concurrent, bounded, loading cache with CART replacement.
///
/// Sits between callers and an expensive value producer (the [`Loader`]),
/// keeping a working set bounded by an entry count and/or a byte budget.
/// Values are handed out as [`Handle`]s that pin them for as long as the
/// caller needs, independent of replacement decisions.
///
/// # Type Parameters
///
/// - `K`: key, `Clone + Eq + Hash`
/// - `V`: value
/// - `L`: the loader
///
/// # Capacity
///
/// At least one of the two limits must be non-zero. The bounds are soft
/// while values are pinned: if every resident value is held by a handle the
/// cache grows past its nominal capacity and resumes evicting once pins
/// drop.
///
/// # Example
///
/// ```
/// use cartkit::cache::CartCache;
/// use cartkit::traits::Loader;
///
/// struct Lines;
///
/// impl Loader<u32, String> for Lines {
///     type Error = std::convert::Infallible;
///     fn acquire(&self, key: &u32) -> Result<String, Self::Error> {
///         Ok(format!("line {key}"))
///     }
///     fn release(&self, _key: &u32, _value: String) {}
///     fn size_of(&self, value: &String) -> usize {
///         value.len()
///     }
/// }
///
/// // Bounded to 1000 entries or 64 KiB, whichever binds first.
/// let cache = CartCache::with_limits(Lines, 1000, 64 * 1024).unwrap();
/// let line = cache.get_or_load(12).unwrap();
/// assert_eq!(&*line, "line 12");
/// ```
pub struct CartCache<K, V, L>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
    L: Loader<K, V> + Send + Sync + 'static,
{
    shared: Arc<Shared<K, V, L>>,
}

impl<K, V, L> CartCache<K, V, L>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
    L: Loader<K, V> + Send + Sync + 'static,
{
    /// Creates a cache bounded by `max_elements` entries and/or `max_memory`
    /// bytes (as reported by the loader's sizer). A zero limit means
    /// unbounded on that axis; both zero is a configuration error.
    pub fn with_limits(
        loader: L,
        max_elements: usize,
        max_memory: usize,
    ) -> Result<Self, ConfigError> {
        if max_elements == 0 && max_memory == 0 {
            return Err(ConfigError::new(
                "at least one capacity limit must be non-zero",
            ));
        }
        Ok(Self {
            shared: Arc::new(Shared {
                loader,
                resident: DashMap::with_hasher(FxBuildHasher::default()),
                pending: Mutex::new(FxHashSet::default()),
                pending_cv: Condvar::new(),
                core: FairMutex::new(CartCore::new(max_elements, max_memory)),
                stats: StatCounters::default(),
            }),
        })
    }

    /// Creates a cache bounded by entry count only.
    pub fn with_capacity(loader: L, max_elements: usize) -> Result<Self, ConfigError> {
        Self::with_limits(loader, max_elements, 0)
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Returns a handle for `key`, loading the value on a miss.
    ///
    /// Hits set the entry's reference bit and take no policy lock.
    /// Concurrent misses on the same key are coalesced: the loader's
    /// `acquire` runs once and every caller gets a handle to the same value.
    /// A loader error leaves the cache unchanged and is returned to the
    /// caller that ran the load; waiting callers retry.
    pub fn get_or_load(&self, key: K) -> Result<Handle<K, V>, L::Error> {
        loop {
            if let Some(handle) = self.try_hit(&key, true) {
                self.shared.stats.inc_hit();
                return Ok(handle);
            }

            let mut pending = self.shared.pending.lock();
            // A load may have finished between the miss and the lock.
            if let Some(handle) = self.try_hit(&key, true) {
                self.shared.stats.inc_hit();
                return Ok(handle);
            }
            if !pending.contains(&key) {
                pending.insert(key.clone());
                drop(pending);

                let permit = LoadPermit {
                    pending: &self.shared.pending,
                    pending_cv: &self.shared.pending_cv,
                    key: Some(key.clone()),
                };
                self.shared.stats.inc_miss();
                let value = self.shared.loader.acquire(&key)?;
                self.shared.stats.inc_load();
                let handle = self.install_value(key, value);
                drop(permit);
                return Ok(handle);
            }
            self.shared.pending_cv.wait(&mut pending);
        }
    }

    /// Returns a handle for `key` if it is resident, without setting the
    /// reference bit or otherwise touching replacement state.
    pub fn peek(&self, key: &K) -> Option<Handle<K, V>> {
        self.try_hit(key, false)
    }

    /// Whether `key` is currently resident. Does not touch replacement state.
    pub fn contains(&self, key: &K) -> bool {
        self.shared.resident.contains_key(key)
    }

    fn try_hit(&self, key: &K, mark_referenced: bool) -> Option<Handle<K, V>> {
        let entry = self.shared.resident.get(key)?;
        if mark_referenced {
            entry.mark_referenced();
        }
        Some(Handle::new(Arc::clone(entry.cell())))
    }

    // =========================================================================
    // Insertion
    // =========================================================================

    /// Installs a caller-supplied value for `key`, returning a handle to it.
    ///
    /// If the key is already resident — or a racing load installs it first —
    /// the existing value wins, the supplied one is dropped, and the
    /// returned handle points at the winner.
    pub fn insert(&self, key: K, value: V) -> Handle<K, V> {
        loop {
            if let Some(handle) = self.try_hit(&key, false) {
                return handle;
            }

            let mut pending = self.shared.pending.lock();
            if let Some(handle) = self.try_hit(&key, false) {
                return handle;
            }
            if !pending.contains(&key) {
                pending.insert(key.clone());
                drop(pending);

                let _permit = LoadPermit {
                    pending: &self.shared.pending,
                    pending_cv: &self.shared.pending_cv,
                    key: Some(key.clone()),
                };
                self.shared.stats.inc_insert();
                return self.install_value(key, value);
            }
            self.shared.pending_cv.wait(&mut pending);
        }
    }

    /// Runs the CART insertion protocol for a value we now own.
    ///
    /// Caller holds the key's pending slot, so the key is not resident and
    /// no other thread can install it.
    fn install_value(&self, key: K, value: V) -> Handle<K, V> {
        let charge = self.shared.loader.size_of(&value);
        let releaser_arc: Arc<dyn Releaser<K, V>> = self.shared.clone();
        let releaser: Weak<dyn Releaser<K, V>> = Arc::downgrade(&releaser_arc);
        let cell = Arc::new(ValueCell::new(key.clone(), value, releaser));
        let handle = Handle::new(Arc::clone(&cell));

        let (ghost_hit, evicted) = {
            let mut core = self.shared.core.lock();
            let report = core.insert(key.clone(), cell, charge);
            self.shared.resident.insert(key, Arc::clone(&report.entry));
            if let Some(evicted) = &report.evicted {
                self.shared.resident.remove(evicted.key());
            }
            (report.ghost_hit, report.evicted)
        };

        if ghost_hit {
            self.shared.stats.inc_ghost_hit();
        }
        if evicted.is_some() {
            self.shared.stats.inc_eviction();
            // Dropped here, after un-indexing and outside the policy lock:
            // if no handle pins it, the release callback runs now.
            drop(evicted);
        }
        handle
    }

    // =========================================================================
    // Removal
    // =========================================================================

    /// Purges `key` unconditionally: the entry leaves the cache without a
    /// ghost trace. No-op if the key is not resident. Outstanding handles
    /// keep the value alive; it is released once they drop.
    pub fn remove(&self, key: &K) {
        let detached = {
            let mut core = self.shared.core.lock();
            match self.shared.resident.remove(key) {
                Some((_, entry)) => {
                    core.detach(&entry);
                    Some(entry)
                },
                None => None,
            }
        };
        drop(detached);
    }

    /// Drops every resident entry and resets all adaptation state.
    ///
    /// For each value, blocks (bounded spin, then yield) until outstanding
    /// handles drop, then hands the value to the loader. After `clear`
    /// returns, every installed value has been released and the next lookup
    /// reloads.
    pub fn clear(&self) {
        let drained = {
            let mut core = self.shared.core.lock();
            self.shared.resident.clear();
            core.reset()
        };

        for entry in drained {
            wait_for_pins(&entry);
            drop(entry);
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// The loader this cache fronts.
    pub fn loader(&self) -> &L {
        &self.shared.loader
    }

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        self.shared.core.lock().resident_len()
    }

    /// Whether no entries are resident.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of the sizer's charge over resident values.
    pub fn used_memory(&self) -> usize {
        self.shared.core.lock().used_memory()
    }

    /// Configured entry limit (0 = unbounded on this axis).
    pub fn max_elements(&self) -> usize {
        self.shared.core.lock().max_elements()
    }

    /// Configured byte limit (0 = unbounded on this axis).
    pub fn max_memory(&self) -> usize {
        self.shared.core.lock().max_memory()
    }

    /// Entries on the recent (seen-once) clock list.
    pub fn recent_len(&self) -> usize {
        self.shared.core.lock().recent_len()
    }

    /// Entries on the frequent (re-referenced) clock list.
    pub fn frequent_len(&self) -> usize {
        self.shared.core.lock().frequent_len()
    }

    /// Keys remembered after demotion from the recent list.
    pub fn ghost_recent_len(&self) -> usize {
        self.shared.core.lock().ghost_recent_len()
    }

    /// Keys remembered after demotion from the frequent list.
    pub fn ghost_frequent_len(&self) -> usize {
        self.shared.core.lock().ghost_frequent_len()
    }

    /// Current adaptation target for the recent list size.
    pub fn target_recent_size(&self) -> usize {
        self.shared.core.lock().target_recent()
    }

    /// Residents currently filtered as Short (transient).
    pub fn short_term_len(&self) -> usize {
        self.shared.core.lock().short_len()
    }

    /// Residents currently filtered as Long (persistent).
    pub fn long_term_len(&self) -> usize {
        self.shared.core.lock().long_len()
    }

    /// Snapshot of the hit/miss/load/release counters.
    pub fn stats(&self) -> CacheStats {
        self.shared.stats.snapshot()
    }

    /// Validates engine invariants and index consistency. Panics on
    /// violation.
    #[cfg(any(test, debug_assertions))]
    pub fn debug_validate_invariants(&self) {
        let core = self.shared.core.lock();
        core.debug_validate_invariants();
        assert_eq!(
            core.resident_len(),
            self.shared.resident.len(),
            "resident index out of sync with clock lists"
        );
    }
}

impl<K, V, L> Drop for CartCache<K, V, L>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
    L: Loader<K, V> + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.clear();
    }
}

/// Spins briefly, then yields, until `entry`'s value has no pin besides the
/// entry's own.
fn wait_for_pins<K, V>(entry: &Arc<Entry<K, V>>) {
    const SPIN_BOUND: u32 = 100;
    let mut tries = 0;
    while Arc::strong_count(entry.cell()) > 1 {
        tries += 1;
        if tries < SPIN_BOUND {
            std::hint::spin_loop();
        } else {
            std::thread::yield_now();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Loader that counts acquires and records releases, like a miss-ratio
    /// harness would.
    struct Probe {
        acquires: AtomicUsize,
        released: StdMutex<Vec<(u32, u64)>>,
        fail_on: Option<u32>,
    }

    impl Probe {
        fn new() -> Self {
            Self {
                acquires: AtomicUsize::new(0),
                released: StdMutex::new(Vec::new()),
                fail_on: None,
            }
        }

        fn failing_on(key: u32) -> Self {
            Self {
                fail_on: Some(key),
                ..Self::new()
            }
        }

        fn acquired(&self) -> usize {
            self.acquires.load(Ordering::SeqCst)
        }

        fn released_keys(&self) -> Vec<u32> {
            self.released.lock().unwrap().iter().map(|(k, _)| *k).collect()
        }
    }

    impl Loader<u32, u64> for Probe {
        type Error = String;

        fn acquire(&self, key: &u32) -> Result<u64, Self::Error> {
            if self.fail_on == Some(*key) {
                return Err(format!("no value for {key}"));
            }
            self.acquires.fetch_add(1, Ordering::SeqCst);
            Ok(u64::from(*key) * 10)
        }

        fn release(&self, key: &u32, value: u64) {
            self.released.lock().unwrap().push((*key, value));
        }
    }

    fn cache(capacity: usize) -> CartCache<u32, u64, Probe> {
        CartCache::with_capacity(Probe::new(), capacity).unwrap()
    }

    #[test]
    fn rejects_zero_limits() {
        assert!(CartCache::with_limits(Probe::new(), 0, 0).is_err());
        assert!(CartCache::with_limits(Probe::new(), 0, 1024).is_ok());
        assert!(CartCache::with_limits(Probe::new(), 4, 0).is_ok());
    }

    #[test]
    fn miss_loads_then_hit_reuses() {
        let cache = cache(4);
        let first = cache.get_or_load(3).unwrap();
        assert_eq!(*first, 30);
        assert_eq!(cache.loader().acquired(), 1);

        let second = cache.get_or_load(3).unwrap();
        assert_eq!(*second, 30);
        assert_eq!(cache.loader().acquired(), 1, "hit must not reload");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.loads, 1);
        cache.debug_validate_invariants();
    }

    #[test]
    fn loader_error_leaves_cache_unchanged() {
        let cache = CartCache::with_capacity(Probe::failing_on(7), 4).unwrap();
        let err = cache.get_or_load(7).unwrap_err();
        assert!(err.contains("7"));
        assert_eq!(cache.len(), 0);
        assert!(!cache.contains(&7));
        cache.debug_validate_invariants();

        // Other keys still load.
        assert_eq!(*cache.get_or_load(8).unwrap(), 80);
    }

    #[test]
    fn peek_does_not_set_reference_bit() {
        // Three quiet residents: the head is demoted on overflow. Peeks must
        // not protect it the way a lookup hit would.
        let cache = cache(3);
        for key in 0..3 {
            cache.get_or_load(key).unwrap();
        }
        for _ in 0..5 {
            assert!(cache.peek(&0).is_some());
        }
        cache.get_or_load(3).unwrap();
        assert!(!cache.contains(&0), "peeked head must still be demoted");
        cache.debug_validate_invariants();
    }

    #[test]
    fn lookup_hit_protects_via_reference_bit() {
        let cache = cache(3);
        for key in 0..3 {
            cache.get_or_load(key).unwrap();
        }
        cache.get_or_load(0).unwrap(); // hit: sets the bit
        cache.get_or_load(3).unwrap();
        assert!(cache.contains(&0), "referenced head survives the sweep");
        assert!(!cache.contains(&1), "the quiet entry behind it is demoted");
        cache.debug_validate_invariants();
    }

    #[test]
    fn peek_misses_return_none() {
        let cache = cache(3);
        assert!(cache.peek(&42).is_none());
        assert_eq!(cache.stats().misses, 0, "peek is not a miss");
    }

    #[test]
    fn insert_returns_existing_on_duplicate() {
        let cache = cache(4);
        let a = cache.insert(1, 111);
        assert_eq!(*a, 111);

        // Second insert loses: gets the existing value, new one is dropped
        // without ever being installed (so the loader never sees it).
        let b = cache.insert(1, 222);
        assert_eq!(*b, 111);
        assert_eq!(cache.len(), 1);
        assert!(cache.loader().released_keys().is_empty());
        cache.debug_validate_invariants();
    }

    #[test]
    fn inserted_values_are_released_on_eviction() {
        let cache = cache(2);
        cache.insert(1, 100);
        cache.insert(2, 200);
        cache.insert(3, 300); // evicts one

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.loader().released_keys().len(), 1);
        cache.debug_validate_invariants();
    }

    #[test]
    fn remove_purges_without_ghost() {
        let cache = cache(4);
        cache.get_or_load(1).unwrap();
        cache.get_or_load(2).unwrap();

        cache.remove(&1);
        assert!(!cache.contains(&1));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.ghost_recent_len(), 0);
        assert_eq!(cache.ghost_frequent_len(), 0);
        assert_eq!(cache.loader().released_keys(), vec![1]);

        cache.remove(&99); // absent: no-op
        assert_eq!(cache.len(), 1);
        cache.debug_validate_invariants();
    }

    #[test]
    fn removed_value_survives_until_handle_drops() {
        let cache = cache(4);
        let handle = cache.get_or_load(1).unwrap();
        cache.remove(&1);

        assert!(!cache.contains(&1));
        assert_eq!(*handle, 10, "pinned value stays readable");
        assert!(cache.loader().released_keys().is_empty());

        drop(handle);
        assert_eq!(cache.loader().released_keys(), vec![1]);
    }

    #[test]
    fn pinned_value_outlives_residency() {
        let cache = cache(2);
        let pinned = cache.get_or_load(1).unwrap();

        // Churn around the pin: demotion always picks the unpinned entry.
        for key in 2..7 {
            cache.get_or_load(key).unwrap();
        }
        assert!(cache.contains(&1), "pinned entries are never demoted");
        assert_eq!(*pinned, 10);

        // Purge it while pinned: leaves the cache, value waits on the pin.
        cache.remove(&1);
        assert!(!cache.contains(&1));
        assert_eq!(*pinned, 10, "value stays readable after leaving the cache");
        assert!(
            !cache.loader().released_keys().contains(&1),
            "release must wait for the pin"
        );

        drop(pinned);
        let released = cache.loader().released_keys();
        assert_eq!(
            released.iter().filter(|k| **k == 1).count(),
            1,
            "exactly one release once the pin drops"
        );
        cache.debug_validate_invariants();
    }

    #[test]
    fn pinned_entries_grow_past_capacity() {
        let cache = cache(2);
        let _a = cache.get_or_load(0).unwrap();
        let _b = cache.get_or_load(1).unwrap();
        let _c = cache.get_or_load(2).unwrap();

        assert_eq!(cache.len(), 3, "soft cap under pins");
        assert_eq!(cache.stats().evictions, 0);
        cache.debug_validate_invariants();
    }

    #[test]
    fn clear_releases_everything_and_resets() {
        let cache = cache(4);
        for key in 0..4 {
            cache.get_or_load(key).unwrap();
        }
        cache.get_or_load(0).unwrap();

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.used_memory(), 0);
        assert_eq!(cache.target_recent_size(), 0);
        assert_eq!(cache.ghost_recent_len(), 0);

        let mut released = cache.loader().released_keys();
        released.sort_unstable();
        assert_eq!(released, vec![0, 1, 2, 3]);

        // Reloads after clear.
        cache.get_or_load(0).unwrap();
        assert_eq!(cache.loader().acquired(), 5);
        cache.debug_validate_invariants();
    }

    #[test]
    fn ghost_hit_adaptation_is_visible() {
        let capacity = 8;
        let cache = cache(capacity);
        for key in 0..capacity as u32 {
            cache.get_or_load(key).unwrap();
        }
        // A fresh wave demotes the originals into ghost_recent.
        for key in 100..(100 + capacity as u32) {
            cache.get_or_load(key).unwrap();
        }
        assert!(cache.ghost_recent_len() > 0);
        let p_before = cache.target_recent_size();
        let long_before = cache.long_term_len();

        cache.get_or_load(0).unwrap(); // ghost hit
        assert!(cache.target_recent_size() > p_before);
        assert_eq!(cache.long_term_len(), long_before + 1);
        assert_eq!(cache.stats().ghost_hits, 1);
        cache.debug_validate_invariants();
    }

    #[test]
    fn byte_budget_limits_residency() {
        struct Sized;
        impl Loader<u32, Vec<u8>> for Sized {
            type Error = std::convert::Infallible;
            fn acquire(&self, key: &u32) -> Result<Vec<u8>, Self::Error> {
                Ok(vec![0u8; if *key % 2 == 0 { 64 } else { 16 }])
            }
            fn release(&self, _key: &u32, _value: Vec<u8>) {}
            fn size_of(&self, value: &Vec<u8>) -> usize {
                value.len()
            }
        }

        let cache = CartCache::with_limits(Sized, 0, 256).unwrap();
        for key in 0..32 {
            cache.get_or_load(key).unwrap();
            cache.debug_validate_invariants();
        }
        // One value may overshoot before the next insertion evicts.
        assert!(cache.used_memory() <= 256 + 64);
    }

    #[test]
    fn capacity_one_with_both_limits_makes_progress() {
        struct Unit;
        impl Loader<u32, u64> for Unit {
            type Error = std::convert::Infallible;
            fn acquire(&self, key: &u32) -> Result<u64, Self::Error> {
                Ok(u64::from(*key))
            }
            fn release(&self, _key: &u32, _value: u64) {}
            fn size_of(&self, _value: &u64) -> usize {
                8
            }
        }

        let cache = CartCache::with_limits(Unit, 1, 8).unwrap();
        for round in 0..6 {
            let key = round % 2;
            assert_eq!(*cache.get_or_load(key).unwrap(), u64::from(key));
            assert_eq!(cache.len(), 1);
            cache.debug_validate_invariants();
        }
    }

    #[test]
    fn drop_releases_residents() {
        struct SharedProbe {
            released: Arc<StdMutex<Vec<u32>>>,
        }

        impl Loader<u32, u64> for SharedProbe {
            type Error = std::convert::Infallible;
            fn acquire(&self, key: &u32) -> Result<u64, Self::Error> {
                Ok(u64::from(*key))
            }
            fn release(&self, key: &u32, _value: u64) {
                self.released.lock().unwrap().push(*key);
            }
        }

        let released = Arc::new(StdMutex::new(Vec::new()));
        {
            let cache = CartCache::with_capacity(
                SharedProbe {
                    released: Arc::clone(&released),
                },
                4,
            )
            .unwrap();
            cache.get_or_load(1).unwrap();
            cache.get_or_load(2).unwrap();
            assert!(released.lock().unwrap().is_empty());
        } // Drop runs clear()

        let mut keys = released.lock().unwrap().clone();
        keys.sort_unstable();
        assert_eq!(keys, vec![1, 2]);
    }
}
