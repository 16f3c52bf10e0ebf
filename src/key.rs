//! Compound key container.
//!
//! Lets a client ride arbitrary user data alongside a cache key without
//! affecting identity: equality and hashing use only the key component, so
//! two compound keys with the same `key` and different `user_data` address
//! the same cache slot.
//!
//! ## Example Usage
//!
//! ```
//! use cartkit::key::CompoundKey;
//! use std::collections::hash_map::DefaultHasher;
//! use std::hash::{Hash, Hasher};
//!
//! let a = CompoundKey::new(7u64, "mip level 3");
//! let b = CompoundKey::new(7u64, "mip level 5");
//!
//! // Same key component: same identity, user data ignored.
//! assert_eq!(a, b);
//!
//! let hash = |k: &CompoundKey<u64, &str>| {
//!     let mut h = DefaultHasher::new();
//!     k.hash(&mut h);
//!     h.finish()
//! };
//! assert_eq!(hash(&a), hash(&b));
//! ```

use std::hash::{Hash, Hasher};

/// A cache key plus client payload; identity comes from `key` alone.
///
/// Useful when the loader needs context (a format hint, a priority, a file
/// offset) that should not participate in lookup.
#[derive(Debug, Clone, Copy)]
pub struct CompoundKey<K, U> {
    /// The identity component. Drives `Eq` and `Hash`.
    pub key: K,
    /// Client payload carried alongside the key. Ignored by `Eq` and `Hash`.
    pub user_data: U,
}

impl<K, U> CompoundKey<K, U> {
    /// Creates a compound key from its parts.
    #[inline]
    pub fn new(key: K, user_data: U) -> Self {
        Self { key, user_data }
    }
}

impl<K: PartialEq, U> PartialEq for CompoundKey<K, U> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<K: Eq, U> Eq for CompoundKey<K, U> {}

impl<K: Hash, U> Hash for CompoundKey<K, U> {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}
