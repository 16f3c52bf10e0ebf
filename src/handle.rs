//! Value pinning and release-exactly-once plumbing.
//!
//! ## Architecture
//!
//! Every installed value lives in one [`ValueCell`], shared through an `Arc`.
//! The strong count of that `Arc` *is* the pin count: the cache's residency
//! holds one reference, every live [`Handle`] one more. When the last
//! reference drops — whichever side that is — the cell's `Drop` hands the
//! value back to the loader, exactly once.
//!
//! ```text
//!             Arc<ValueCell>                 strong count
//!   ┌────────────────────────────┐
//!   │ resident Entry ────────────┼──► 1   (the cache's own pin)
//!   │ Handle #1      ────────────┼──► 2
//!   │ Handle #2      ────────────┼──► 3
//!   └────────────────────────────┘
//!
//!   eviction drops the entry  ──► 2   (value outlives residency)
//!   handles drop              ──► 0   ──► ValueCell::drop ──► loader.release
//! ```
//!
//! A handle therefore stays readable after its entry is evicted, and the
//! loader never sees a value that a live handle can still reach.
//!
//! ## Key Components
//!
//! - [`Handle`]: public, clonable pin. `Deref`s to the value.
//! - [`ValueCell`]: crate-internal cell owning the value and the release path.
//! - `Releaser`: crate-internal hook the cell calls on its way out, kept as a
//!   type-erased weak reference so `Handle<K, V>` carries no loader type.

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Weak};

/// Receives values whose last pin dropped. Implemented by the cache shell.
pub(crate) trait Releaser<K, V>: Send + Sync {
    fn release(&self, key: &K, value: V);
}

/// One installed value. The strong count of its `Arc` is the pin count.
pub(crate) struct ValueCell<K, V> {
    key: K,
    /// Always `Some` while any reference exists; taken exactly once in `drop`.
    value: Option<V>,
    releaser: Weak<dyn Releaser<K, V>>,
}

impl<K, V> ValueCell<K, V> {
    pub(crate) fn new(key: K, value: V, releaser: Weak<dyn Releaser<K, V>>) -> Self {
        Self {
            key,
            value: Some(value),
            releaser,
        }
    }

    #[inline]
    pub(crate) fn key(&self) -> &K {
        &self.key
    }

    #[inline]
    pub(crate) fn value(&self) -> &V {
        match &self.value {
            Some(value) => value,
            // `value` is taken only in `drop`, which cannot run while a
            // reference to the cell exists.
            None => unreachable!("value cell read after drop"),
        }
    }
}

impl<K, V> Drop for ValueCell<K, V> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            if let Some(releaser) = self.releaser.upgrade() {
                releaser.release(&self.key, value);
            }
        }
    }
}

/// A scoped pin on a cached value.
///
/// Holding a handle keeps the value alive and readable regardless of what
/// the replacement policy does: an evicted value is only handed back to the
/// loader once the last handle drops. Cloning a handle adds a pin; dropping
/// one removes it.
///
/// Handles are cheap (`Arc` clone) and can be sent across threads when the
/// key and value types allow it.
///
/// # Example
///
/// ```
/// use cartkit::cache::CartCache;
/// use cartkit::traits::Loader;
///
/// struct Ident;
/// impl Loader<u32, String> for Ident {
///     type Error = std::convert::Infallible;
///     fn acquire(&self, key: &u32) -> Result<String, Self::Error> {
///         Ok(format!("value-{key}"))
///     }
///     fn release(&self, _key: &u32, _value: String) {}
/// }
///
/// let cache = CartCache::with_capacity(Ident, 4).unwrap();
/// let handle = cache.get_or_load(7).unwrap();
/// assert_eq!(handle.key(), &7);
/// assert_eq!(&*handle, "value-7");
///
/// let pin = handle.clone(); // second pin on the same value
/// drop(handle);
/// assert_eq!(pin.value(), "value-7");
/// ```
pub struct Handle<K, V> {
    cell: Arc<ValueCell<K, V>>,
}

impl<K, V> Handle<K, V> {
    pub(crate) fn new(cell: Arc<ValueCell<K, V>>) -> Self {
        Self { cell }
    }

    /// The key this handle pins.
    #[inline]
    pub fn key(&self) -> &K {
        self.cell.key()
    }

    /// The pinned value.
    #[inline]
    pub fn value(&self) -> &V {
        self.cell.value()
    }
}

impl<K, V> Clone for Handle<K, V> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<K, V> Deref for Handle<K, V> {
    type Target = V;

    #[inline]
    fn deref(&self) -> &V {
        self.cell.value()
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for Handle<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("key", self.key())
            .field("value", self.value())
            .finish()
    }
}
