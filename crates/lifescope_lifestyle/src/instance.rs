//! Cached instance wrapper.
//!
//! A [`CachedInstance`] pairs a built instance with the release path of the
//! factory that built it. Disposing the wrapper (which the store does when
//! the scope closes) forwards to that release path, guarded so the instance
//! is released at most once no matter how many paths race to release it.

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lifescope_store::value::ScopedValue;

/// The external factory's release path for an instance.
///
/// Returns whether the factory actually released the instance.
pub type ReleaseFn<C> = Arc<dyn Fn(&Arc<C>) -> bool + Send + Sync>;

/// An instance cached in an open scope, together with its release hook.
pub struct CachedInstance<C: ?Sized> {
    instance: Arc<C>,
    release: ReleaseFn<C>,
    released: AtomicBool,
}

impl<C: ?Sized + Send + Sync + 'static> CachedInstance<C> {
    /// Wraps `instance` with the release hook of its owner.
    #[must_use]
    pub fn new(instance: Arc<C>, release: ReleaseFn<C>) -> Self {
        Self {
            instance,
            release,
            released: AtomicBool::new(false),
        }
    }

    /// Returns the wrapped instance.
    #[must_use]
    pub fn instance(&self) -> &Arc<C> {
        &self.instance
    }

    /// Returns `true` once the instance has been released or claimed for
    /// release.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Claims the instance for release without running the hook.
    ///
    /// Returns `true` for the single caller that wins the claim.
    pub(crate) fn claim(&self) -> bool {
        !self.released.swap(true, Ordering::AcqRel)
    }

    /// Runs the release hook unless the instance was already claimed.
    ///
    /// Returns whether this call ran the hook.
    pub fn release(&self) -> bool {
        if !self.claim() {
            return false;
        }
        (self.release)(&self.instance);
        true
    }
}

impl<C: ?Sized + Send + Sync + 'static> ScopedValue for CachedInstance<C> {
    fn dispose(&self) {
        if self.release() {
            tracing::trace!(
                instance = core::any::type_name::<C>(),
                "released cached instance on scope close"
            );
        }
    }
}

impl<C: ?Sized> fmt::Debug for CachedInstance<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedInstance")
            .field("instance", &core::any::type_name::<C>())
            .field("released", &self.released.load(Ordering::Acquire))
            .finish()
    }
}
