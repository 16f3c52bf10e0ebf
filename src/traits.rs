//! # Loader Contract
//!
//! This module defines the [`Loader`] trait: the seam between the cache and
//! the expensive value producer it fronts (a disk store, a decoder, a remote
//! service).
//!
//! ## Architecture
//!
//! ```text
//!   ┌──────────────┐   miss    ┌──────────────────┐   acquire(key)   ┌──────────┐
//!   │    client    │ ────────► │  CartCache<K,V>  │ ───────────────► │  Loader  │
//!   │              │ ◄──────── │                  │ ◄─────────────── │          │
//!   └──────────────┘  Handle   │  (CART policy)   │      value       └──────────┘
//!                              │                  │
//!                              │   on last drop   │   release(key, value)
//!                              │ ───────────────────────────────────►
//!                              └──────────────────┘
//! ```
//!
//! ## Contract Summary
//!
//! | Operation  | When called                               | Notes                          |
//! |------------|-------------------------------------------|--------------------------------|
//! | `acquire`  | On a deduplicated miss, no cache lock held | May block (I/O). At most once per residency. |
//! | `release`  | When the cache and every handle let go     | Exactly once per installed value. |
//! | `size_of`  | Once at install                            | Must be stable for a given value. |
//!
//! ## Re-entrancy
//!
//! `release` may run while another thread is inside the cache (and, during
//! [`clear`](crate::cache::CartCache::clear), on the clearing thread itself).
//! A loader must not call back into the same cache from `release`.
//!
//! ## Example
//!
//! ```
//! use cartkit::traits::Loader;
//!
//! /// Fronts a table of blobs keyed by id.
//! struct BlobStore;
//!
//! impl Loader<u64, Vec<u8>> for BlobStore {
//!     type Error = std::io::Error;
//!
//!     fn acquire(&self, key: &u64) -> Result<Vec<u8>, Self::Error> {
//!         Ok(key.to_le_bytes().to_vec()) // stand-in for a disk read
//!     }
//!
//!     fn release(&self, _key: &u64, value: Vec<u8>) {
//!         drop(value); // stand-in for write-back / unmap
//!     }
//!
//!     fn size_of(&self, value: &Vec<u8>) -> usize {
//!         value.len()
//!     }
//! }
//! ```

/// Produces, releases and sizes the values the cache manages.
///
/// The cache calls `acquire` on a miss (after per-key deduplication, so
/// concurrent misses on one key trigger a single call), remembers the value,
/// and calls `release` exactly once when the value's last pin drops — whether
/// that is an eviction, an explicit [`remove`](crate::cache::CartCache::remove),
/// a [`clear`](crate::cache::CartCache::clear), or the drop of the last
/// outstanding [`Handle`](crate::handle::Handle) to an already-evicted value.
///
/// Values handed to [`insert`](crate::cache::CartCache::insert) by the caller
/// go through the same `release` path; a loader must be prepared to receive
/// values it did not itself produce.
pub trait Loader<K, V> {
    /// Error type surfaced to `get_or_load` callers when a value cannot be
    /// produced.
    type Error;

    /// Produces the value for `key`. May block.
    ///
    /// On error the cache is left unchanged and the error is returned to the
    /// caller; another caller may retry the load.
    fn acquire(&self, key: &K) -> Result<V, Self::Error>;

    /// Takes back ownership of a value the cache is done with.
    ///
    /// Called exactly once per value returned from `acquire` or handed to
    /// `insert`, and never while a handle still pins the value.
    fn release(&self, key: &K, value: V);

    /// Reports the byte charge of a value, used against the cache's byte
    /// budget. Must be inexpensive and stable for a given value.
    ///
    /// The default charges the value's shallow size.
    fn size_of(&self, value: &V) -> usize {
        let _ = value;
        std::mem::size_of::<V>()
    }
}
