//! Clock with Adaptive Replacement and Temporal filtering (CART) engine.
//!
//! The single-threaded policy core. It owns the two resident clock lists and
//! the two ghost lists, runs the clock sweeps and the adaptation of the
//! recency/frequency balance, and decides which entry to demote on a miss.
//! The concurrent shell in [`crate::cache`] drives it under one lock.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                            CartCore<K, V> Layout                            │
//! │                                                                             │
//! │   Resident clock lists (FIFO deques of Arc<Entry>)                          │
//! │                                                                             │
//! │   recent (T1): seen once since entering      frequent (T2): re-referenced   │
//! │   head ──► [e] [e] [e] [e] ◄── tail          head ──► [e] [e] ◄── tail      │
//! │     ▲ sweep: rotate referenced,                ▲ sweep: referenced heads    │
//! │     │ transfer long-term & quiet               │ return to recent tail      │
//! │     │ heads to frequent                        │                            │
//! │                                                                             │
//! │   Ghost lists (keys only, GhostQueue)                                       │
//! │                                                                             │
//! │   ghost_recent (B1): demoted from recent     ghost_frequent (B2): from      │
//! │   front=MRU ──► [k] [k] [k] ◄── back=LRU     frequent, same shape           │
//! │                                                                             │
//! │   Adaptation state                                                          │
//! │     target_recent       (p): target |recent|, moved by ghost hits           │
//! │     target_ghost_recent (q): target |ghost_recent|, moved by sweeps         │
//! │     short_len / long_len (nS / nL): temporal-filter census of residents     │
//! │                                                                             │
//! │   Every entry carries three relaxed-atomic flags:                           │
//! │     referenced  — set by lock-free hits, cleared by the sweep               │
//! │     long_term   — temporal filter: Short (transient) vs Long (persistent)   │
//! │     in_recent   — which clock list the entry sits in                        │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Miss protocol (one call to [`CartCore::insert`])
//!
//! 1. Capture the effective capacity `c = max(configured, resident)` so the
//!    sweep keeps making progress when the byte budget — or pinned entries —
//!    pushed the resident count past the configured element limit.
//! 2. If full: sweep the frequent head (referenced heads go back to the
//!    recent tail, growing `q`), then sweep the recent head (referenced heads
//!    rotate and may be promoted Short→Long; quiet long-term heads transfer
//!    to the frequent tail, shrinking `q`).
//! 3. Demote the first unpinned entry — from `recent` when it is at least
//!    `max(1, p)` long, otherwise from `frequent` — onto the matching ghost
//!    list. If everything is pinned, skip: the cache grows past its nominal
//!    capacity until pins drop.
//! 4. Trim ghost history to `c + 1` keys, steering by `q`.
//! 5. Install the new entry: cold keys enter `recent` as Short; ghost hits
//!    re-enter `recent` as Long and move `p` toward the list that would have
//!    kept them.
//!
//! ## Operations
//!
//! | Operation  | Time        | Notes                                         |
//! |------------|-------------|-----------------------------------------------|
//! | `insert`   | O(1)*       | *Amortized; a sweep touches each entry once   |
//! | `detach`   | O(n)        | Position scan of one clock list               |
//! | `reset`    | O(n)        | Drains everything                             |
//! | accessors  | O(1)        |                                               |
//!
//! ## Thread Safety
//!
//! Not thread-safe; `&mut self` throughout. The shell serializes calls with
//! its policy lock. The only concession to concurrency is that the entry
//! flags are atomics, because the hit path sets `referenced` without that
//! lock — a benign race: a set bit lost to a concurrent clear just defers
//! one eviction by one sweep.
//!
//! ## References
//!
//! - Bansal & Modha, "CAR: Clock with Adaptive Replacement", FAST 2004
//!   (CART is the temporal-filtering variant from the same paper).

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::ds::GhostQueue;
use crate::handle::ValueCell;

// =============================================================================
// Entry
// =============================================================================

/// A resident clock element: the pinned value cell plus policy metadata.
///
/// Shared between the policy lists and the resident index. The flags are
/// relaxed atomics so the lock-free hit path can set `referenced` while the
/// sweep reads and clears it under the policy lock.
pub(crate) struct Entry<K, V> {
    cell: Arc<ValueCell<K, V>>,
    /// Byte charge remembered from install time; the sizer is required to be
    /// stable per value, so eviction subtracts the same amount.
    charge: usize,
    referenced: AtomicBool,
    long_term: AtomicBool,
    in_recent: AtomicBool,
}

impl<K, V> Entry<K, V> {
    fn new(cell: Arc<ValueCell<K, V>>, charge: usize, long_term: bool) -> Self {
        Self {
            cell,
            charge,
            referenced: AtomicBool::new(false),
            long_term: AtomicBool::new(long_term),
            in_recent: AtomicBool::new(true),
        }
    }

    #[inline]
    pub(crate) fn key(&self) -> &K {
        self.cell.key()
    }

    #[inline]
    pub(crate) fn cell(&self) -> &Arc<ValueCell<K, V>> {
        &self.cell
    }

    #[inline]
    pub(crate) fn charge(&self) -> usize {
        self.charge
    }

    /// Lock-free hit notification.
    #[inline]
    pub(crate) fn mark_referenced(&self) {
        self.referenced.store(true, Ordering::Relaxed);
    }

    #[inline]
    fn is_referenced(&self) -> bool {
        self.referenced.load(Ordering::Relaxed)
    }

    #[inline]
    fn clear_referenced(&self) {
        self.referenced.store(false, Ordering::Relaxed);
    }

    #[inline]
    fn is_long_term(&self) -> bool {
        self.long_term.load(Ordering::Relaxed)
    }

    #[inline]
    fn set_long_term(&self, long: bool) {
        self.long_term.store(long, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn in_recent(&self) -> bool {
        self.in_recent.load(Ordering::Relaxed)
    }

    #[inline]
    fn set_in_recent(&self, recent: bool) {
        self.in_recent.store(recent, Ordering::Relaxed);
    }

    /// Whether no handle pins the value: the entry's own reference to the
    /// cell is the only one left. A concurrent hit may pin right after this
    /// returns true; the entry is then simply skipped one sweep later than
    /// it could have been, or released by the handle once it drops.
    #[inline]
    fn is_unpinned(&self) -> bool {
        Arc::strong_count(&self.cell) == 1
    }
}

/// Outcome of one insertion, applied to the resident index by the caller.
pub(crate) struct InsertReport<K, V> {
    /// The freshly installed entry, to be indexed under its key.
    pub(crate) entry: Arc<Entry<K, V>>,
    /// The entry demoted to make room, if any; already detached from the
    /// clock lists and recorded as a ghost. The caller un-indexes it and
    /// drops it (which releases the value unless handles still pin it).
    pub(crate) evicted: Option<Arc<Entry<K, V>>>,
    /// Whether the key was found on a ghost list (drives the stats).
    pub(crate) ghost_hit: bool,
}

// =============================================================================
// CartCore
// =============================================================================

/// The CART replacement engine.
#[must_use]
pub(crate) struct CartCore<K, V> {
    /// T1: residents seen once since entering the cache.
    recent: VecDeque<Arc<Entry<K, V>>>,
    /// T2: residents re-referenced while resident.
    frequent: VecDeque<Arc<Entry<K, V>>>,
    /// B1: keys recently demoted from `recent`.
    ghost_recent: GhostQueue<K>,
    /// B2: keys recently demoted from `frequent`.
    ghost_frequent: GhostQueue<K>,
    /// p: target size for `recent`, in [0, c].
    target_recent: usize,
    /// q: target size for `ghost_recent`, in [0, 2c].
    target_ghost_recent: usize,
    /// nS: Short-filtered residents.
    short_len: usize,
    /// nL: Long-filtered residents.
    long_len: usize,
    used_memory: usize,
    max_elements: usize,
    max_memory: usize,
}

impl<K, V> CartCore<K, V>
where
    K: Clone + Eq + Hash,
{
    /// Creates an engine with the given limits. The caller validates that at
    /// least one limit is non-zero.
    pub(crate) fn new(max_elements: usize, max_memory: usize) -> Self {
        Self {
            recent: VecDeque::new(),
            frequent: VecDeque::new(),
            ghost_recent: GhostQueue::new(),
            ghost_frequent: GhostQueue::new(),
            target_recent: 0,
            target_ghost_recent: 0,
            short_len: 0,
            long_len: 0,
            used_memory: 0,
            max_elements,
            max_memory,
        }
    }

    // =========================================================================
    // Capacity
    // =========================================================================

    #[inline]
    pub(crate) fn resident_len(&self) -> usize {
        self.recent.len() + self.frequent.len()
    }

    #[inline]
    fn is_full(&self) -> bool {
        (self.max_elements != 0 && self.resident_len() >= self.max_elements)
            || (self.max_memory != 0 && self.used_memory >= self.max_memory)
    }

    /// The capacity the algorithm runs against for one insertion: the
    /// configured element limit, or the current resident count when the byte
    /// budget (or pinned entries) pushed residency past it.
    #[inline]
    fn effective_capacity(&self) -> usize {
        self.max_elements.max(self.resident_len())
    }

    // =========================================================================
    // Insertion protocol
    // =========================================================================

    /// Runs the full miss protocol for `key` and installs `cell`.
    ///
    /// The caller guarantees `key` is not resident.
    pub(crate) fn insert(
        &mut self,
        key: K,
        cell: Arc<ValueCell<K, V>>,
        charge: usize,
    ) -> InsertReport<K, V> {
        let capacity = self.effective_capacity();

        let mut evicted = None;
        if self.is_full() {
            self.sweep_frequent(capacity);
            self.sweep_recent(capacity);
            evicted = self.demote_one();
            if !self.ghost_recent.contains(&key) && !self.ghost_frequent.contains(&key) {
                self.trim_ghosts(capacity);
            }
        }

        let (entry, ghost_hit) = self.install(key, cell, charge, capacity);
        self.used_memory += charge;

        InsertReport {
            entry,
            evicted,
            ghost_hit,
        }
    }

    /// Frequent-head sweep: referenced heads return to the recent tail with
    /// the bit cleared. Each step shrinks `frequent`, so this terminates on
    /// its own. Growing history pressure bumps `q` upward.
    fn sweep_frequent(&mut self, capacity: usize) {
        while self
            .frequent
            .front()
            .is_some_and(|entry| entry.is_referenced())
        {
            let Some(entry) = self.frequent.pop_front() else {
                break;
            };
            entry.clear_referenced();
            entry.set_in_recent(true);
            self.recent.push_back(entry);

            if self.frequent.len() + self.ghost_frequent.len() + self.recent.len() - self.short_len
                >= capacity
            {
                self.target_ghost_recent = (self.target_ghost_recent + 1)
                    .min((2 * capacity).saturating_sub(self.recent.len()));
            }
        }
    }

    /// Recent-head sweep: referenced heads rotate to the tail (possibly
    /// promoting Short→Long); quiet long-term heads transfer to the frequent
    /// tail and pull `q` back down.
    ///
    /// Bounded: a hit stream racing the reference bits must not let
    /// rotations starve the lock holder, so the sweep gets a fixed step
    /// budget and resumes on the next miss if it runs out.
    fn sweep_recent(&mut self, capacity: usize) {
        for _ in 0..(2 * capacity + 1) {
            let keep_sweeping = self
                .recent
                .front()
                .is_some_and(|entry| entry.is_long_term() || entry.is_referenced());
            if !keep_sweeping {
                break;
            }
            let Some(entry) = self.recent.pop_front() else {
                break;
            };

            if entry.is_referenced() {
                entry.clear_referenced();
                let was_short = !entry.is_long_term();
                self.recent.push_back(Arc::clone(&entry));

                // A Short entry still resident once the recent list has
                // grown to its target has proven persistent.
                if self.recent.len() >= (self.target_recent + 1).min(self.ghost_recent.len())
                    && was_short
                {
                    entry.set_long_term(true);
                    self.short_len -= 1;
                    self.long_len += 1;
                }
            } else {
                entry.set_in_recent(false);
                self.frequent.push_back(entry);

                self.target_ghost_recent = self
                    .target_ghost_recent
                    .saturating_sub(1)
                    .max(capacity.saturating_sub(self.recent.len()));
            }
        }
    }

    /// Demotes the first unpinned entry to its ghost list, preferring the
    /// recent list while it is at least `max(1, p)` long. Returns `None`
    /// when every resident entry is pinned; the cache then grows past its
    /// nominal capacity (soft cap, not an error).
    fn demote_one(&mut self) -> Option<Arc<Entry<K, V>>> {
        if self.recent.len() >= self.target_recent.max(1) {
            if let Some(idx) = self.recent.iter().position(|entry| entry.is_unpinned()) {
                if let Some(entry) = self.recent.remove(idx) {
                    if entry.is_long_term() {
                        self.long_len -= 1;
                    } else {
                        self.short_len -= 1;
                    }
                    self.ghost_recent.push_front(entry.key().clone());
                    self.used_memory = self.used_memory.saturating_sub(entry.charge());
                    return Some(entry);
                }
            }
        }

        if let Some(idx) = self.frequent.iter().position(|entry| entry.is_unpinned()) {
            if let Some(entry) = self.frequent.remove(idx) {
                // The frequent list carries only long-term entries.
                self.long_len -= 1;
                self.ghost_frequent.push_front(entry.key().clone());
                self.used_memory = self.used_memory.saturating_sub(entry.charge());
                return Some(entry);
            }
        }

        None
    }

    /// Bounds ghost history to `capacity + 1` keys, trimming `ghost_recent`
    /// while it exceeds its target `q` (or `ghost_frequent` is empty).
    fn trim_ghosts(&mut self, capacity: usize) {
        if self.ghost_recent.len() + self.ghost_frequent.len() >= capacity + 1 {
            if self.ghost_recent.len() > self.target_ghost_recent || self.ghost_frequent.is_empty()
            {
                self.ghost_recent.pop_back();
            } else {
                self.ghost_frequent.pop_back();
            }
        }
    }

    /// Installs the new entry, consuming a ghost hit if there is one.
    fn install(
        &mut self,
        key: K,
        cell: Arc<ValueCell<K, V>>,
        charge: usize,
        capacity: usize,
    ) -> (Arc<Entry<K, V>>, bool) {
        if self.ghost_recent.contains(&key) {
            // The key would have survived in a larger recent list: grow p.
            let delta = (self.short_len / self.ghost_recent.len()).max(1);
            self.target_recent = (self.target_recent + delta).min(capacity);
            self.ghost_recent.remove(&key);

            let entry = Arc::new(Entry::new(cell, charge, true));
            self.long_len += 1;
            self.recent.push_back(Arc::clone(&entry));
            (entry, true)
        } else if self.ghost_frequent.contains(&key) {
            // The key would have survived in a larger frequent list: shrink p.
            let delta = (self.long_len / self.ghost_frequent.len()).max(1);
            self.target_recent = self.target_recent.saturating_sub(delta);
            self.ghost_frequent.remove(&key);

            let entry = Arc::new(Entry::new(cell, charge, true));
            self.long_len += 1;
            self.recent.push_back(Arc::clone(&entry));

            if self.frequent.len() + self.ghost_frequent.len() + self.recent.len() - self.short_len
                >= capacity
            {
                self.target_ghost_recent = (self.target_ghost_recent + 1)
                    .min((2 * capacity).saturating_sub(self.recent.len()));
            }
            (entry, true)
        } else {
            // Cold miss: enter the recent list as a Short (transient) entry.
            let entry = Arc::new(Entry::new(cell, charge, false));
            self.short_len += 1;
            self.recent.push_back(Arc::clone(&entry));
            (entry, false)
        }
    }

    // =========================================================================
    // Removal and reset
    // =========================================================================

    /// Detaches `entry` from its clock list without creating a ghost.
    /// Returns whether the entry was found.
    pub(crate) fn detach(&mut self, entry: &Arc<Entry<K, V>>) -> bool {
        let queue = if entry.in_recent() {
            &mut self.recent
        } else {
            &mut self.frequent
        };
        let Some(idx) = queue.iter().position(|e| Arc::ptr_eq(e, entry)) else {
            return false;
        };
        queue.remove(idx);

        if entry.is_long_term() {
            self.long_len -= 1;
        } else {
            self.short_len -= 1;
        }
        self.used_memory = self.used_memory.saturating_sub(entry.charge());
        true
    }

    /// Drains both clock lists, clears the ghosts and zeroes all adaptation
    /// state. The drained entries are returned so the caller can wait out
    /// their pins before dropping them.
    pub(crate) fn reset(&mut self) -> Vec<Arc<Entry<K, V>>> {
        let drained: Vec<_> = self
            .recent
            .drain(..)
            .chain(self.frequent.drain(..))
            .collect();
        self.ghost_recent.clear();
        self.ghost_frequent.clear();
        self.target_recent = 0;
        self.target_ghost_recent = 0;
        self.short_len = 0;
        self.long_len = 0;
        self.used_memory = 0;
        drained
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub(crate) fn recent_len(&self) -> usize {
        self.recent.len()
    }

    pub(crate) fn frequent_len(&self) -> usize {
        self.frequent.len()
    }

    pub(crate) fn ghost_recent_len(&self) -> usize {
        self.ghost_recent.len()
    }

    pub(crate) fn ghost_frequent_len(&self) -> usize {
        self.ghost_frequent.len()
    }

    pub(crate) fn target_recent(&self) -> usize {
        self.target_recent
    }

    pub(crate) fn short_len(&self) -> usize {
        self.short_len
    }

    pub(crate) fn long_len(&self) -> usize {
        self.long_len
    }

    pub(crate) fn used_memory(&self) -> usize {
        self.used_memory
    }

    pub(crate) fn max_elements(&self) -> usize {
        self.max_elements
    }

    pub(crate) fn max_memory(&self) -> usize {
        self.max_memory
    }

    // =========================================================================
    // Invariant validation
    // =========================================================================

    /// Validates internal invariants. Panics if any is violated.
    #[cfg(any(test, debug_assertions))]
    pub(crate) fn debug_validate_invariants(&self) {
        assert_eq!(
            self.short_len + self.long_len,
            self.resident_len(),
            "filter census {} + {} != resident {}",
            self.short_len,
            self.long_len,
            self.resident_len()
        );

        let cap = self.effective_capacity();
        assert!(
            self.target_recent <= cap,
            "p({}) > capacity({})",
            self.target_recent,
            cap
        );
        assert!(
            self.target_ghost_recent <= 2 * cap,
            "q({}) > 2 * capacity({})",
            self.target_ghost_recent,
            cap
        );

        let shorts = self
            .recent
            .iter()
            .chain(self.frequent.iter())
            .filter(|entry| !entry.is_long_term())
            .count();
        assert_eq!(shorts, self.short_len, "Short census drifted");

        for entry in &self.recent {
            assert!(entry.in_recent(), "recent list entry flagged as frequent");
        }
        for entry in &self.frequent {
            assert!(!entry.in_recent(), "frequent list entry flagged as recent");
            assert!(entry.is_long_term(), "frequent list entry is Short");
        }

        // Residents and ghosts are disjoint.
        for entry in self.recent.iter().chain(self.frequent.iter()) {
            assert!(
                !self.ghost_recent.contains(entry.key()),
                "resident key also in ghost_recent"
            );
            assert!(
                !self.ghost_frequent.contains(entry.key()),
                "resident key also in ghost_frequent"
            );
        }

        self.ghost_recent.debug_validate();
        self.ghost_frequent.debug_validate();
    }

    /// Keys currently resident, recent list first. Test-only.
    #[cfg(test)]
    pub(crate) fn resident_keys(&self) -> Vec<K> {
        self.recent
            .iter()
            .chain(self.frequent.iter())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Whether `key` sits on either ghost list. Test-only.
    #[cfg(test)]
    pub(crate) fn is_ghost_key(&self, key: &K) -> bool {
        self.ghost_recent.contains(key) || self.ghost_frequent.contains(key)
    }
}

impl<K, V> std::fmt::Debug for CartCore<K, V>
where
    K: Clone + Eq + Hash,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CartCore")
            .field("recent_len", &self.recent.len())
            .field("frequent_len", &self.frequent.len())
            .field("ghost_recent_len", &self.ghost_recent.len())
            .field("ghost_frequent_len", &self.ghost_frequent.len())
            .field("target_recent", &self.target_recent)
            .field("target_ghost_recent", &self.target_ghost_recent)
            .field("short_len", &self.short_len)
            .field("long_len", &self.long_len)
            .field("used_memory", &self.used_memory)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================


#[cfg(test)]
mod property_tests {
    use super::tests_support::*;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Insert(u32),
        Touch(u32),
        Detach(u32),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u32..40).prop_map(Op::Insert),
            (0u32..40).prop_map(Op::Touch),
            (0u32..40).prop_map(Op::Detach),
        ]
    }

    proptest! {
        /// Without pins, residency never exceeds the configured capacity.
        #[cfg_attr(miri, ignore)]
        #[test]
        fn prop_resident_bounded(
            capacity in 1usize..16,
            keys in prop::collection::vec(0u32..64, 0..200)
        ) {
            let mut harness = Harness::new(capacity);
            for key in keys {
                harness.insert(key);
                prop_assert!(harness.core.resident_len() <= capacity);
                harness.core.debug_validate_invariants();
            }
        }

        /// Ghost history stays within c + 1 under pure insert churn.
        #[cfg_attr(miri, ignore)]
        #[test]
        fn prop_ghost_history_bounded(
            capacity in 1usize..16,
            keys in prop::collection::vec(0u32..256, 0..300)
        ) {
            let mut harness = Harness::new(capacity);
            for key in keys {
                harness.insert(key);
                prop_assert!(
                    harness.core.ghost_recent_len() + harness.core.ghost_frequent_len()
                        <= capacity + 1
                );
            }
        }

        /// Arbitrary operation sequences keep every structural invariant.
        #[cfg_attr(miri, ignore)]
        #[test]
        fn prop_arbitrary_ops_maintain_invariants(
            capacity in 1usize..12,
            ops in prop::collection::vec(op_strategy(), 0..250)
        ) {
            let mut harness = Harness::new(capacity);
            for op in ops {
                match op {
                    Op::Insert(key) => harness.insert(key),
                    Op::Touch(key) => harness.touch(key),
                    Op::Detach(key) => harness.detach(key),
                }
                harness.core.debug_validate_invariants();
                prop_assert!(harness.core.resident_len() <= capacity);
            }
        }

        /// A re-inserted ghost always comes back long-term.
        #[cfg_attr(miri, ignore)]
        #[test]
        fn prop_ghost_hits_reenter_long(
            capacity in 1usize..8,
            keys in prop::collection::vec(0u32..16, 1..120)
        ) {
            let mut harness = Harness::new(capacity);
            for key in keys {
                let was_ghost = harness.is_ghost(key);
                let long = harness.insert_reporting(key);
                if was_ghost {
                    prop_assert!(long, "ghost hit must install as Long");
                }
            }
        }
    }
}
