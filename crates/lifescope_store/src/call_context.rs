//! Propagating scope slots carried along a logical call graph.
//!
//! A [`CallContext`] is the explicit stand-in for ambient, thread-flowing
//! storage. It maps each context type to the scope currently open for it and
//! is passed to every call that may need scoped storage.
//!
//! # Propagation
//!
//! A context belongs to one execution unit. Clones are further handles to
//! that same unit: a scope opened through one clone is visible through all of
//! them. Forking produces a **snapshot** for a child unit: the child sees
//! every scope that was open at fork time and shares their caches with the
//! parent, but scopes opened later in the parent are invisible to it.
//!
//! ```text
//! root ──open(Request)──► root ──fork──► child  (sees Request, same cache)
//!   │
//!   └──fork──► early                          (forked before: sees nothing)
//!
//! CallContext::new()                            (unrelated graph: sees nothing)
//! ```
//!
//! A unit carries at most one open scope per context type, and a child cannot
//! shadow an inherited scope: opening a scope of a context type the unit
//! already carries fails. Closing a scope marks it closed for every context
//! holding it.

use core::fmt;
use std::sync::Arc;
use std::thread;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::context::{ContextKey, ScopeContext};
use crate::store::{ScopeId, ScopeState};

/// Scope slots visible to one execution unit.
///
/// Cloning returns another handle to the same unit. [`fork`](Self::fork) is
/// cheap too: slots are copied on write.
///
/// # Example
///
/// ```
/// use lifescope_store::prelude::*;
///
/// struct PerRequest;
///
/// let registry = StoreRegistry::new();
/// let store = registry.store::<PerRequest>();
///
/// let ctx = CallContext::new();
/// let early = ctx.fork();
/// let same = ctx.clone();
/// store.open_scope(&ctx).unwrap();
/// let child = ctx.fork();
///
/// assert!(same.is_open::<PerRequest>());
/// assert!(child.is_open::<PerRequest>());
/// assert!(!early.is_open::<PerRequest>());
/// assert!(!CallContext::new().is_open::<PerRequest>());
///
/// store.close_scope(&ctx).unwrap();
/// assert!(!child.is_open::<PerRequest>());
/// ```
#[derive(Clone, Default)]
pub struct CallContext {
    slots: Arc<RwLock<Slots>>,
}

/// Copy-on-write snapshot of a unit's slots.
type Slots = Arc<HashMap<ContextKey, Arc<ScopeState>>>;

impl CallContext {
    /// Creates an empty root context, the start of an unrelated call graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of this context for a child execution unit.
    #[must_use]
    pub fn fork(&self) -> Self {
        let snapshot = Arc::clone(&*self.slots.read());
        Self {
            slots: Arc::new(RwLock::new(snapshot)),
        }
    }

    /// Returns `true` if `other` is a handle to the same execution unit.
    #[must_use]
    pub fn same_unit(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slots, &other.slots)
    }

    /// Returns `true` if a scope of context type `T` is open in this context.
    #[must_use]
    pub fn is_open<T: ScopeContext>(&self) -> bool {
        self.open_state(&ContextKey::of::<T>()).is_some()
    }

    /// Returns the identifier of the open scope of context type `T`.
    #[must_use]
    pub fn scope_id<T: ScopeContext>(&self) -> Option<ScopeId> {
        self.open_state(&ContextKey::of::<T>())
            .map(|state| state.id())
    }

    /// Returns the names of all context types with an open scope, sorted.
    #[must_use]
    pub fn open_contexts(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self
            .slots
            .read()
            .iter()
            .filter(|(_, state)| state.is_open())
            .map(|(key, _)| key.name())
            .collect();
        names.sort_unstable();
        names
    }

    /// Runs `f` on a new thread with a fork of this context.
    ///
    /// # Panics
    ///
    /// Panics if the OS fails to create a thread, like [`std::thread::spawn`].
    pub fn spawn<F, R>(&self, f: F) -> thread::JoinHandle<R>
    where
        F: FnOnce(CallContext) -> R + Send + 'static,
        R: Send + 'static,
    {
        let ctx = self.fork();
        thread::spawn(move || f(ctx))
    }

    /// Runs `f` on a scoped thread with a fork of this context.
    ///
    /// # Panics
    ///
    /// Panics if the OS fails to create a thread, like [`std::thread::Scope::spawn`].
    pub fn spawn_scoped<'scope, 'env, F, R>(
        &self,
        scope: &'scope thread::Scope<'scope, 'env>,
        f: F,
    ) -> thread::ScopedJoinHandle<'scope, R>
    where
        F: FnOnce(CallContext) -> R + Send + 'scope,
        R: Send + 'scope,
    {
        let ctx = self.fork();
        scope.spawn(move || f(ctx))
    }

    /// Runs the future built by `f` as a tokio task with a fork of this
    /// context.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime, like [`tokio::spawn`].
    #[cfg(feature = "tokio")]
    pub fn spawn_task<F, Fut>(&self, f: F) -> tokio::task::JoinHandle<Fut::Output>
    where
        F: FnOnce(CallContext) -> Fut,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        tokio::spawn(f(self.fork()))
    }

    /// Returns the state of `key`'s scope if it is open.
    pub(crate) fn open_state(&self, key: &ContextKey) -> Option<Arc<ScopeState>> {
        self.slots
            .read()
            .get(key)
            .filter(|state| state.is_open())
            .cloned()
    }

    /// Publishes `state` as the open scope for `key` in this unit.
    ///
    /// Returns `false` if the unit already carries an open scope for `key`;
    /// a closed inherited slot is replaced. Earlier forks keep their own snapshot.
    pub(crate) fn install(&self, key: ContextKey, state: Arc<ScopeState>) -> bool {
        let mut slots = self.slots.write();
        if slots.get(&key).is_some_and(|current| current.is_open()) {
            return false;
        }
        Arc::make_mut(&mut *slots).insert(key, state);
        true
    }

    /// Retracts `key`'s slot from this unit if it still holds scope `id`.
    pub(crate) fn retract(&self, key: &ContextKey, id: ScopeId) {
        let mut slots = self.slots.write();
        if slots.get(key).is_some_and(|state| state.id() == id) {
            Arc::make_mut(&mut *slots).remove(key);
        }
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("open", &self.open_contexts())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StoreRegistry;

    struct Request;
    struct Transaction;

    #[test]
    fn new_context_has_no_open_scopes() {
        let ctx = CallContext::new();
        assert!(!ctx.is_open::<Request>());
        assert!(ctx.open_contexts().is_empty());
        assert_eq!(ctx.scope_id::<Request>(), None);
    }

    #[test]
    fn fork_after_open_inherits_scope() {
        let registry = StoreRegistry::new();
        let store = registry.store::<Request>();
        let ctx = CallContext::new();

        let id = store.open_scope(&ctx).unwrap();
        let child = ctx.fork();

        assert_eq!(child.scope_id::<Request>(), Some(id));
        store.close_scope(&ctx).unwrap();
    }

    #[test]
    fn fork_before_open_does_not_inherit() {
        let registry = StoreRegistry::new();
        let store = registry.store::<Request>();
        let ctx = CallContext::new();

        let early = ctx.fork();
        store.open_scope(&ctx).unwrap();

        assert!(!early.is_open::<Request>());
        assert!(ctx.is_open::<Request>());
        store.close_scope(&ctx).unwrap();
    }

    #[test]
    fn clone_shares_unit_and_fork_does_not() {
        let registry = StoreRegistry::new();
        let store = registry.store::<Request>();
        let ctx = CallContext::new();
        let same = ctx.clone();
        let early = ctx.fork();

        assert!(same.same_unit(&ctx));
        assert!(!early.same_unit(&ctx));

        store.open_scope(&same).unwrap();
        assert!(ctx.is_open::<Request>());
        assert!(!early.is_open::<Request>());
        store.close_scope(&ctx).unwrap();
        assert!(same.open_contexts().is_empty());
    }

    #[test]
    fn child_cannot_shadow_inherited_scope() {
        let registry = StoreRegistry::new();
        let store = registry.store::<Request>();
        let ctx = CallContext::new();

        store.open_scope(&ctx).unwrap();
        let child = ctx.fork();
        assert!(store.open_scope(&child).is_err());
        store.close_scope(&ctx).unwrap();
    }

    #[test]
    fn close_is_observed_by_forks() {
        let registry = StoreRegistry::new();
        let store = registry.store::<Request>();
        let ctx = CallContext::new();

        store.open_scope(&ctx).unwrap();
        let child = ctx.fork();
        store.close_scope(&ctx).unwrap();

        assert!(!child.is_open::<Request>());
        // The stale slot is replaced by a fresh scope
        store.open_scope(&child).unwrap();
        assert!(child.is_open::<Request>());
        assert!(!ctx.is_open::<Request>());
        store.close_scope(&child).unwrap();
    }

    #[test]
    fn open_contexts_lists_sorted_names() {
        let registry = StoreRegistry::new();
        let ctx = CallContext::new();

        registry.store::<Transaction>().open_scope(&ctx).unwrap();
        registry.store::<Request>().open_scope(&ctx).unwrap();

        let mut expected = vec![Request::context_name(), Transaction::context_name()];
        expected.sort_unstable();
        assert_eq!(ctx.open_contexts(), expected);

        registry.store::<Request>().close_scope(&ctx).unwrap();
        registry.store::<Transaction>().close_scope(&ctx).unwrap();
    }

    #[test]
    fn spawn_passes_a_fork() {
        let registry = StoreRegistry::new();
        let store = registry.store::<Request>();
        let ctx = CallContext::new();

        let id = store.open_scope(&ctx).unwrap();
        let seen = ctx
            .spawn(|child| child.scope_id::<Request>())
            .join()
            .unwrap();

        assert_eq!(seen, Some(id));
        store.close_scope(&ctx).unwrap();
    }

    #[test]
    fn spawn_scoped_borrows_environment() {
        let registry = StoreRegistry::new();
        let store = registry.store::<Request>();
        let ctx = CallContext::new();
        store.open_scope(&ctx).unwrap();

        let open = thread::scope(|s| {
            ctx.spawn_scoped(s, |child| store.is_open(&child))
                .join()
                .unwrap()
        });

        assert!(open);
        store.close_scope(&ctx).unwrap();
    }
}
