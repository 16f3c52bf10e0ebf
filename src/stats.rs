//! Cache statistics counters.
//!
//! Always-on relaxed atomic counters with a plain snapshot type. Counters are
//! approximate under concurrency (relaxed ordering) but each individual event
//! is counted exactly once.
//!
//! ## Key Components
//!
//! - [`CacheStats`]: point-in-time snapshot returned by
//!   [`CartCache::stats`](crate::cache::CartCache::stats).
//! - `StatCounters`: internal atomic counters embedded in the cache.
//!
//! ## Example Usage
//!
//! ```
//! use cartkit::cache::CartCache;
//! use cartkit::traits::Loader;
//!
//! struct Ident;
//! impl Loader<u32, u32> for Ident {
//!     type Error = std::convert::Infallible;
//!     fn acquire(&self, key: &u32) -> Result<u32, Self::Error> { Ok(*key) }
//!     fn release(&self, _key: &u32, _value: u32) {}
//! }
//!
//! let cache = CartCache::with_capacity(Ident, 8).unwrap();
//! let _a = cache.get_or_load(1).unwrap(); // miss + load
//! let _b = cache.get_or_load(1).unwrap(); // hit
//!
//! let stats = cache.stats();
//! assert_eq!(stats.hits, 1);
//! assert_eq!(stats.misses, 1);
//! assert_eq!(stats.loads, 1);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from the resident set.
    pub hits: u64,
    /// Lookups that entered the insertion protocol.
    pub misses: u64,
    /// Values produced by the loader.
    pub loads: u64,
    /// Values installed via explicit `insert`.
    pub inserts: u64,
    /// Resident entries demoted to a ghost list.
    pub evictions: u64,
    /// Misses whose key was found in a ghost list.
    pub ghost_hits: u64,
    /// Values handed back to the loader.
    pub releases: u64,
}

impl CacheStats {
    /// Hit ratio over all lookups, or 0.0 before any lookup.
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Atomic counters backing [`CacheStats`].
#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    inserts: AtomicU64,
    evictions: AtomicU64,
    ghost_hits: AtomicU64,
    releases: AtomicU64,
}

impl StatCounters {
    /// Snapshot current counters.
    pub(crate) fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            ghost_hits: self.ghost_hits.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn inc_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_load(&self) {
        self.loads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_insert(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_ghost_hit(&self) {
        self.ghost_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inc_release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }
}
