//! The resolution-cache adapter.
//!
//! [`ScopedLifestyle`] implements "one instance per open scope" for instances
//! built by an external factory such as a dependency-injection container.
//!
//! # State Machine
//!
//! Per adapter, per open scope:
//!
//! ```text
//! Unresolved ──resolve──► Resolved ──scope close──► Released (terminal)
//!     ▲                      │
//!     └──────release─────────┘
//! ```
//!
//! After an explicit [`release`](ScopedLifestyle::release), the next
//! [`resolve`](ScopedLifestyle::resolve) in the same scope builds a fresh
//! instance. The scope remembers what was released through the adapter, so
//! handing the same instance back twice reaches the release path once.

use core::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use lifescope_store::call_context::CallContext;
use lifescope_store::context::ScopeContext;
use lifescope_store::error::ScopeError;
use lifescope_store::registry::StoreRegistry;
use lifescope_store::store::ScopeStore;
use lifescope_store::value::{ScopeKey, ScopedValue};

use crate::instance::{CachedInstance, ReleaseFn};

/// Caches one instance of `C` per open scope of context type `T`.
///
/// Each adapter is its own cache key: two adapters wrapping the same build
/// function still produce distinct instances.
///
/// # Example
///
/// ```
/// use core::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
/// use lifescope_lifestyle::ScopedLifestyle;
/// use lifescope_store::prelude::*;
///
/// struct PerRequest;
///
/// #[derive(Default)]
/// struct Connection { closes: AtomicUsize }
///
/// let registry = StoreRegistry::new();
/// let lifestyle = ScopedLifestyle::<PerRequest, Connection>::from_registry(
///     &registry,
///     |conn| {
///         conn.closes.fetch_add(1, Ordering::SeqCst);
///         true
///     },
/// );
///
/// let conn = {
///     let scope = LifetimeScope::<PerRequest>::open(&registry, &CallContext::new()).unwrap();
///     lifestyle.resolve(scope.context(), || Arc::new(Connection::default())).unwrap()
/// };
///
/// // Released exactly once when the scope closed
/// assert_eq!(conn.closes.load(Ordering::SeqCst), 1);
/// ```
pub struct ScopedLifestyle<T: ScopeContext, C: ?Sized + Send + Sync + 'static> {
    store: Arc<ScopeStore<T>>,
    key: ScopeKey,
    released_key: ScopeKey,
    release: ReleaseFn<C>,
}

/// Instances released through one adapter in one scope.
///
/// Holds weak references: an entry keeps the allocation's address reserved,
/// not the instance alive.
struct ReleasedSet<C: ?Sized> {
    instances: Mutex<Vec<Weak<C>>>,
}

impl<C: ?Sized> Default for ReleasedSet<C> {
    fn default() -> Self {
        Self {
            instances: Mutex::new(Vec::new()),
        }
    }
}

impl<C: ?Sized> ReleasedSet<C> {
    /// Records `instance`, returning `false` if it was already recorded.
    fn insert(&self, instance: &Arc<C>) -> bool {
        let mut instances = self.instances.lock();
        instances.retain(|seen| seen.strong_count() > 0);
        if instances
            .iter()
            .any(|seen| core::ptr::addr_eq(seen.as_ptr(), Arc::as_ptr(instance)))
        {
            return false;
        }
        instances.push(Arc::downgrade(instance));
        true
    }
}

impl<C: ?Sized + Send + Sync + 'static> ScopedValue for ReleasedSet<C> {}

impl<T: ScopeContext, C: ?Sized + Send + Sync + 'static> ScopedLifestyle<T, C> {
    /// Creates an adapter over `store`.
    ///
    /// `release` is the external factory's release path; it runs for every
    /// instance this adapter hands back, either on explicit release or when
    /// the scope closes.
    pub fn new<R>(store: Arc<ScopeStore<T>>, release: R) -> Self
    where
        R: Fn(&Arc<C>) -> bool + Send + Sync + 'static,
    {
        Self {
            store,
            key: ScopeKey::unique(),
            released_key: ScopeKey::unique(),
            release: Arc::new(release),
        }
    }

    /// Creates an adapter over `registry`'s store for `T`.
    pub fn from_registry<R>(registry: &StoreRegistry, release: R) -> Self
    where
        R: Fn(&Arc<C>) -> bool + Send + Sync + 'static,
    {
        Self::new(registry.store::<T>(), release)
    }

    /// Returns the instance cached for this adapter in the scope visible in
    /// `ctx`, building it with `build` on first use.
    ///
    /// `build` runs at most once per scope (until an explicit release).
    ///
    /// # Errors
    ///
    /// [`ScopeError::NotOpen`] if no scope of `T` is visible in `ctx`.
    pub fn resolve<F>(&self, ctx: &CallContext, build: F) -> Result<Arc<C>, ScopeError>
    where
        F: FnOnce() -> Arc<C>,
    {
        let release = Arc::clone(&self.release);
        let cached = self.store.get_or_add(ctx, self.key, move |_| {
            Arc::new(CachedInstance::new(build(), release))
        })?;
        Ok(Arc::clone(cached.instance()))
    }

    /// Releases `instance` through the external factory.
    ///
    /// If this scope caches `instance` for this adapter, the cache entry is
    /// detached first, so a later [`resolve`](Self::resolve) in the same scope
    /// builds a fresh instance and closing the scope does not release it a
    /// second time. Instances the scope does not hold are forwarded as-is.
    ///
    /// Returns what the release path returned, or `false` without calling it
    /// if the instance was already released through this adapter in this
    /// scope.
    ///
    /// # Errors
    ///
    /// [`ScopeError::NotOpen`] if no scope of `T` is visible in `ctx`.
    pub fn release(&self, ctx: &CallContext, instance: &Arc<C>) -> Result<bool, ScopeError> {
        let released = self.store.get_or_add(ctx, self.released_key, |_| {
            Arc::new(ReleasedSet::<C>::default())
        })?;
        if !released.insert(instance) {
            tracing::trace!(
                context = self.store.context_name(),
                key = %self.key,
                "instance already released"
            );
            return Ok(false);
        }

        let detached = self
            .store
            .remove_if::<Arc<CachedInstance<C>>, _>(ctx, self.key, |cached| {
                Arc::ptr_eq(cached.instance(), instance)
            })?;

        match detached {
            Some(cached) if !cached.claim() => Ok(false),
            Some(_) => {
                tracing::trace!(
                    context = self.store.context_name(),
                    key = %self.key,
                    "detached cached instance on release"
                );
                Ok((self.release)(instance))
            }
            None => Ok((self.release)(instance)),
        }
    }

    /// Returns `true` if an instance is cached for this adapter in the scope
    /// visible in `ctx`.
    ///
    /// # Errors
    ///
    /// [`ScopeError::NotOpen`] if no scope of `T` is visible in `ctx`.
    pub fn is_resolved(&self, ctx: &CallContext) -> Result<bool, ScopeError> {
        self.store.contains(ctx, self.key)
    }

    /// Returns this adapter's cache key.
    #[must_use]
    pub fn key(&self) -> ScopeKey {
        self.key
    }

    /// Returns the store this adapter caches into.
    #[must_use]
    pub fn store(&self) -> &Arc<ScopeStore<T>> {
        &self.store
    }
}

impl<T: ScopeContext, C: ?Sized + Send + Sync + 'static> fmt::Debug for ScopedLifestyle<T, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedLifestyle")
            .field("context", &self.store.context_name())
            .field("instance", &core::any::type_name::<C>())
            .field("key", &self.key)
            .field("released_key", &self.released_key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use lifescope_store::handle::LifetimeScope;

    struct Request;

    #[derive(Debug, Default)]
    struct Service {
        released: AtomicUsize,
    }

    impl Service {
        fn times_released(&self) -> usize {
            self.released.load(Ordering::SeqCst)
        }
    }

    fn lifestyle(registry: &StoreRegistry) -> ScopedLifestyle<Request, Service> {
        ScopedLifestyle::from_registry(registry, |service: &Arc<Service>| {
            service.released.fetch_add(1, Ordering::SeqCst);
            true
        })
    }

    fn build() -> Arc<Service> {
        Arc::new(Service::default())
    }

    #[test]
    fn resolve_without_scope_fails() {
        let registry = StoreRegistry::new();
        let lifestyle = lifestyle(&registry);

        let err = lifestyle.resolve(&CallContext::new(), build).unwrap_err();
        assert_eq!(
            err,
            ScopeError::NotOpen {
                context: Request::context_name()
            }
        );
    }

    #[test]
    fn build_runs_once_per_scope() {
        let registry = StoreRegistry::new();
        let lifestyle = lifestyle(&registry);
        let builds = AtomicUsize::new(0);
        let scope = LifetimeScope::<Request>::open(&registry, &CallContext::new()).unwrap();

        for _ in 0..3 {
            lifestyle
                .resolve(scope.context(), || {
                    builds.fetch_add(1, Ordering::SeqCst);
                    build()
                })
                .unwrap();
        }

        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn state_machine_transitions() {
        let registry = StoreRegistry::new();
        let lifestyle = lifestyle(&registry);
        let scope = LifetimeScope::<Request>::open(&registry, &CallContext::new()).unwrap();
        let ctx = scope.context();

        assert!(!lifestyle.is_resolved(ctx).unwrap());
        let first = lifestyle.resolve(ctx, build).unwrap();
        assert!(lifestyle.is_resolved(ctx).unwrap());

        assert!(lifestyle.release(ctx, &first).unwrap());
        assert!(!lifestyle.is_resolved(ctx).unwrap());

        let second = lifestyle.resolve(ctx, build).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));

        drop(scope);
        assert_eq!(first.times_released(), 1);
        assert_eq!(second.times_released(), 1);
    }

    #[test]
    fn releasing_stale_instance_keeps_current_one() {
        let registry = StoreRegistry::new();
        let lifestyle = lifestyle(&registry);
        let scope = LifetimeScope::<Request>::open(&registry, &CallContext::new()).unwrap();
        let ctx = scope.context();

        let first = lifestyle.resolve(ctx, build).unwrap();
        lifestyle.release(ctx, &first).unwrap();
        let second = lifestyle.resolve(ctx, build).unwrap();

        // `first` is no longer cached and already released
        assert!(!lifestyle.release(ctx, &first).unwrap());
        assert_eq!(first.times_released(), 1);
        assert!(lifestyle.is_resolved(ctx).unwrap());
        let again = lifestyle.resolve(ctx, build).unwrap();
        assert!(Arc::ptr_eq(&second, &again));
    }

    #[test]
    fn double_release_runs_release_path_once() {
        let registry = StoreRegistry::new();
        let lifestyle = lifestyle(&registry);
        let scope = LifetimeScope::<Request>::open(&registry, &CallContext::new()).unwrap();
        let ctx = scope.context();

        let service = lifestyle.resolve(ctx, build).unwrap();
        assert!(lifestyle.release(ctx, &service).unwrap());
        assert!(!lifestyle.release(ctx, &service).unwrap());
        assert_eq!(service.times_released(), 1);

        drop(scope);
        assert_eq!(service.times_released(), 1);
    }

    #[test]
    fn foreign_instance_is_forwarded_once() {
        let registry = StoreRegistry::new();
        let lifestyle = lifestyle(&registry);
        let scope = LifetimeScope::<Request>::open(&registry, &CallContext::new()).unwrap();
        let ctx = scope.context();

        let cached = lifestyle.resolve(ctx, build).unwrap();
        let foreign = build();
        assert!(lifestyle.release(ctx, &foreign).unwrap());
        assert!(!lifestyle.release(ctx, &foreign).unwrap());
        assert_eq!(foreign.times_released(), 1);

        // The cached instance is unaffected
        assert!(lifestyle.is_resolved(ctx).unwrap());
        drop(scope);
        assert_eq!(cached.times_released(), 1);
    }

    #[test]
    fn released_instances_are_forgotten_with_the_scope() {
        let registry = StoreRegistry::new();
        let lifestyle = lifestyle(&registry);
        let root = CallContext::new();
        let service = build();

        let first = LifetimeScope::<Request>::open(&registry, &root).unwrap();
        assert!(lifestyle.release(first.context(), &service).unwrap());
        drop(first);

        let second = LifetimeScope::<Request>::open(&registry, &root).unwrap();
        assert!(lifestyle.release(second.context(), &service).unwrap());
        assert_eq!(service.times_released(), 2);
    }

    #[test]
    fn release_outside_scope_fails() {
        let registry = StoreRegistry::new();
        let lifestyle = lifestyle(&registry);
        let service = build();

        assert!(matches!(
            lifestyle.release(&CallContext::new(), &service),
            Err(ScopeError::NotOpen { .. })
        ));
        assert_eq!(service.times_released(), 0);
    }
}
