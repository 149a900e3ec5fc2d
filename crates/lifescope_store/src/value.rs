//! Cache keys and stored values.
//!
//! This module provides [`ScopeKey`], the opaque identity a caller uses to
//! address its entry in an open scope, and the [`ScopedValue`] trait every
//! cached value implements.
//!
//! # Disposal
//!
//! Closing a scope calls [`ScopedValue::dispose`] exactly once on every value
//! still held by the scope. Values removed with
//! [`ScopeStore::try_remove`](crate::store::ScopeStore::try_remove) are not
//! disposed; that becomes the caller's responsibility.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use downcast_rs::{DowncastSync, impl_downcast};

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of a cache entry owner.
///
/// Each caller that caches a value in a scope allocates one key and reuses it
/// for every scope. Keys are process-unique.
///
/// ```
/// use lifescope_store::value::ScopeKey;
///
/// assert_ne!(ScopeKey::unique(), ScopeKey::unique());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeKey(u64);

impl ScopeKey {
    /// Allocates a new process-unique key.
    #[must_use]
    pub fn unique() -> Self {
        Self(NEXT_KEY.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw key value.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key#{}", self.0)
    }
}

/// A value that can be cached in an open scope.
///
/// Implement this for every type stored through
/// [`ScopeStore::get_or_add`](crate::store::ScopeStore::get_or_add). Override
/// [`dispose`](Self::dispose) for values that hold resources which must be
/// released when the scope closes.
///
/// # Example
///
/// ```
/// use core::sync::atomic::{AtomicBool, Ordering};
/// use lifescope_store::value::ScopedValue;
///
/// // Plain value, nothing to release
/// #[derive(Clone)]
/// struct TenantId(String);
/// impl ScopedValue for TenantId {}
///
/// // Disposable value
/// #[derive(Default)]
/// struct Connection { closed: AtomicBool }
///
/// impl ScopedValue for Connection {
///     fn dispose(&self) {
///         self.closed.store(true, Ordering::SeqCst);
///     }
/// }
/// ```
pub trait ScopedValue: DowncastSync {
    /// Releases resources held by the value when its scope closes.
    ///
    /// Called at most once per stored value by the store. The default does
    /// nothing.
    fn dispose(&self) {}
}

impl_downcast!(sync ScopedValue);

impl<V: ScopedValue + ?Sized> ScopedValue for Arc<V> {
    fn dispose(&self) {
        (**self).dispose();
    }
}

/// `None` is the zero value: stored and returned as-is, nothing to dispose.
impl<V: ScopedValue> ScopedValue for Option<V> {
    fn dispose(&self) {
        if let Some(value) = self {
            value.dispose();
        }
    }
}
