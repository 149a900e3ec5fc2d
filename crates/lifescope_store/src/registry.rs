//! Store registry and configuration.
//!
//! The [`StoreRegistry`] owns exactly one [`ScopeStore`] per context type. It
//! is built once, usually at process start, and shared by reference (or
//! `Arc`) with every component that needs scoped storage.
//!
//! # Leak Reporting
//!
//! A scope that is opened but never closed keeps its cached values alive
//! until the last call context carrying it is dropped. When that happens the
//! leak is counted and handled according to the configured [`LeakPolicy`].
//!
//! ```
//! use lifescope_store::prelude::*;
//!
//! struct Job;
//!
//! let registry = StoreRegistry::with_config(
//!     RegistryConfig::default().with_leak_policy(LeakPolicy::Ignore),
//! );
//!
//! {
//!     let ctx = CallContext::new();
//!     registry.store::<Job>().open_scope(&ctx).unwrap();
//!     // `ctx` dropped without closing the scope
//! }
//!
//! assert_eq!(registry.leaked_scopes(), 1);
//! ```

use core::any::Any;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::context::{ContextKey, ScopeContext};
use crate::store::{ScopeId, ScopeStore};
use crate::value::ScopedValue;

/// What to do with a scope that was never closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LeakPolicy {
    /// Count the leak silently.
    Ignore,
    /// Count the leak and emit a `tracing` warning (default).
    #[default]
    Warn,
    /// Count the leak, emit a warning, and dispose the leaked values.
    Dispose,
}

/// Configuration shared by every store a registry builds.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryConfig {
    /// Handling of scopes dropped while still open.
    pub leak_policy: LeakPolicy,
}

impl RegistryConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the leak policy.
    #[must_use]
    pub fn with_leak_policy(mut self, policy: LeakPolicy) -> Self {
        self.leak_policy = policy;
        self
    }
}

/// Counts and reports scopes dropped while still open.
#[derive(Debug)]
pub(crate) struct LeakTracker {
    policy: LeakPolicy,
    leaked: AtomicUsize,
}

impl LeakTracker {
    pub(crate) fn new(policy: LeakPolicy) -> Self {
        Self {
            policy,
            leaked: AtomicUsize::new(0),
        }
    }

    pub(crate) fn report(
        &self,
        context: ContextKey,
        scope: ScopeId,
        values: Vec<Box<dyn ScopedValue>>,
    ) {
        self.leaked.fetch_add(1, Ordering::SeqCst);

        if self.policy == LeakPolicy::Ignore {
            return;
        }

        tracing::warn!(
            context = context.name(),
            %scope,
            entries = values.len(),
            "lifetime scope dropped without being closed"
        );

        if self.policy == LeakPolicy::Dispose {
            for value in values {
                value.dispose();
            }
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.leaked.load(Ordering::SeqCst)
    }
}

/// Type-erased store for dynamic storage.
type BoxedStore = Arc<dyn Any + Send + Sync>;

/// Registry owning one [`ScopeStore`] per context type.
///
/// Stores are created lazily on first request and live as long as the
/// registry.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use lifescope_store::registry::StoreRegistry;
///
/// struct PerRequest;
///
/// let registry = StoreRegistry::new();
/// let a = registry.store::<PerRequest>();
/// let b = registry.store::<PerRequest>();
/// assert!(Arc::ptr_eq(&a, &b));
/// ```
pub struct StoreRegistry {
    stores: RwLock<HashMap<ContextKey, BoxedStore>>,
    config: RegistryConfig,
    leaks: Arc<LeakTracker>,
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreRegistry {
    /// Creates a registry with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Creates a registry with the given configuration.
    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            stores: RwLock::new(HashMap::new()),
            config,
            leaks: Arc::new(LeakTracker::new(config.leak_policy)),
        }
    }

    /// Returns the store for context type `T`, creating it on first use.
    #[must_use]
    pub fn store<T: ScopeContext>(&self) -> Arc<ScopeStore<T>> {
        let key = ContextKey::of::<T>();

        if let Some(store) = self.stores.read().get(&key) {
            return Self::downcast(Arc::clone(store));
        }

        let mut stores = self.stores.write();
        let store = stores.entry(key).or_insert_with(|| {
            tracing::trace!(context = key.name(), "creating scope store");
            let store: BoxedStore = Arc::new(ScopeStore::<T>::new(Arc::clone(&self.leaks)));
            store
        });
        Self::downcast(Arc::clone(store))
    }

    fn downcast<T: ScopeContext>(store: BoxedStore) -> Arc<ScopeStore<T>> {
        store
            .downcast::<ScopeStore<T>>()
            .unwrap_or_else(|_| unreachable!("stores are keyed by their context type"))
    }

    /// Returns `true` if a store for `T` has been created.
    #[must_use]
    pub fn contains<T: ScopeContext>(&self) -> bool {
        self.stores.read().contains_key(&ContextKey::of::<T>())
    }

    /// Returns the number of stores created so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stores.read().len()
    }

    /// Returns `true` if no store has been created yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stores.read().is_empty()
    }

    /// Returns the registry's configuration.
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Returns how many scopes were dropped without being closed.
    #[must_use]
    pub fn leaked_scopes(&self) -> usize {
        self.leaks.count()
    }
}

impl core::fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StoreRegistry")
            .field("stores", &self.len())
            .field("config", &self.config)
            .field("leaked_scopes", &self.leaked_scopes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_context::CallContext;
    use core::sync::atomic::AtomicBool;

    struct Request;
    struct Transaction;

    #[derive(Default)]
    struct Socket {
        closed: AtomicBool,
    }

    impl ScopedValue for Socket {
        fn dispose(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn one_store_per_context_type() {
        let registry = StoreRegistry::new();
        assert!(registry.is_empty());

        let a = registry.store::<Request>();
        let b = registry.store::<Request>();
        let _ = registry.store::<Transaction>();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 2);
        assert!(registry.contains::<Request>());
    }

    #[test]
    fn separate_registries_have_separate_stores() {
        let first = StoreRegistry::new();
        let second = StoreRegistry::new();
        assert!(!Arc::ptr_eq(
            &first.store::<Request>(),
            &second.store::<Request>()
        ));
    }

    #[test]
    fn config_builder() {
        let config = RegistryConfig::new().with_leak_policy(LeakPolicy::Dispose);
        assert_eq!(config.leak_policy, LeakPolicy::Dispose);
        assert_eq!(RegistryConfig::default().leak_policy, LeakPolicy::Warn);
    }

    #[test]
    fn closed_scopes_are_not_leaks() {
        let registry = StoreRegistry::new();
        let store = registry.store::<Request>();

        let ctx = CallContext::new();
        store.open_scope(&ctx).unwrap();
        store.close_scope(&ctx).unwrap();
        drop(ctx);

        assert_eq!(registry.leaked_scopes(), 0);
    }

    #[test]
    fn dropped_open_scope_is_counted() {
        let registry = StoreRegistry::new();
        let store = registry.store::<Request>();

        let ctx = CallContext::new();
        store.open_scope(&ctx).unwrap();
        let child = ctx.fork();
        drop(ctx);

        // Still reachable through the fork
        assert_eq!(registry.leaked_scopes(), 0);

        drop(child);
        assert_eq!(registry.leaked_scopes(), 1);
    }

    #[test]
    fn dispose_policy_disposes_leaked_values() {
        let registry = StoreRegistry::with_config(
            RegistryConfig::new().with_leak_policy(LeakPolicy::Dispose),
        );
        let store = registry.store::<Request>();
        let key = crate::value::ScopeKey::unique();

        let ctx = CallContext::new();
        store.open_scope(&ctx).unwrap();
        let socket = store
            .get_or_add(&ctx, key, |_| Arc::new(Socket::default()))
            .unwrap();
        drop(ctx);

        assert_eq!(registry.leaked_scopes(), 1);
        assert!(socket.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn warn_policy_keeps_leaked_values() {
        let registry = StoreRegistry::new();
        let store = registry.store::<Request>();
        let key = crate::value::ScopeKey::unique();

        let ctx = CallContext::new();
        store.open_scope(&ctx).unwrap();
        let socket = store
            .get_or_add(&ctx, key, |_| Arc::new(Socket::default()))
            .unwrap();
        drop(ctx);

        assert_eq!(registry.leaked_scopes(), 1);
        assert!(!socket.closed.load(Ordering::SeqCst));
    }
}
