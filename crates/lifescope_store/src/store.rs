//! The scope store.
//!
//! A [`ScopeStore`] exists once per context type (per
//! [`StoreRegistry`](crate::registry::StoreRegistry)). It opens and closes
//! scopes in a [`CallContext`] and exposes a typed get-or-create / remove API
//! over the open scope's cache.
//!
//! # Locking
//!
//! Every operation holds the store's lock for its whole duration, including
//! the user-supplied factory in [`get_or_add`](ScopeStore::get_or_add). A slow
//! factory therefore blocks every other operation on the same context type.
//! The lock is reentrant: a factory may resolve further values of the same
//! context type on the same thread.
//!
//! Locks of different context types are independent. A factory that resolves
//! from another context type's store takes that store's lock while holding
//! its own, so two threads doing so in opposite orders deadlock. Keep one
//! order across the application: resolve outer context types from inner
//! factories, never the reverse.
//!
//! # Invariants
//!
//! - At most one scope per context type is visible in a call context.
//! - A scope's values are disposed exactly once, when it closes.
//! - Values removed explicitly are never disposed by the store.

use core::fmt;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use hashbrown::HashMap;
use hashbrown::hash_map::Entry;
use parking_lot::{Mutex, ReentrantMutex};

use crate::call_context::CallContext;
use crate::context::{ContextKey, ScopeContext};
use crate::error::ScopeError;
use crate::registry::LeakTracker;
use crate::value::{ScopeKey, ScopedValue};

static NEXT_SCOPE: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of one opened scope.
///
/// Used in diagnostics to tell consecutive scopes of the same context apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(u64);

impl ScopeId {
    fn next() -> Self {
        Self(NEXT_SCOPE.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw identifier.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope#{}", self.0)
    }
}

/// Type-erased cached value.
type BoxedValue = Box<dyn ScopedValue>;

/// State of one open scope, shared by every call context that inherited it.
pub(crate) struct ScopeState {
    id: ScopeId,
    context: ContextKey,
    /// Cleared when the scope closes; forks holding the state see it closed.
    open: AtomicBool,
    entries: Mutex<HashMap<ScopeKey, BoxedValue>>,
    leaks: Arc<LeakTracker>,
}

impl ScopeState {
    fn new(context: ContextKey, leaks: Arc<LeakTracker>) -> Self {
        Self {
            id: ScopeId::next(),
            context,
            open: AtomicBool::new(true),
            entries: Mutex::new(HashMap::new()),
            leaks,
        }
    }

    pub(crate) fn id(&self) -> ScopeId {
        self.id
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }

    fn drain(&self) -> Vec<BoxedValue> {
        self.entries.lock().drain().map(|(_, value)| value).collect()
    }
}

impl Drop for ScopeState {
    fn drop(&mut self) {
        if *self.open.get_mut() {
            let values = self.entries.get_mut().drain().map(|(_, v)| v).collect();
            self.leaks.report(self.context, self.id, values);
        }
    }
}

impl fmt::Debug for ScopeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeState")
            .field("id", &self.id)
            .field("context", &self.context.name())
            .field("open", &self.is_open())
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}

/// Per-context-type store of open scopes.
///
/// Obtain one through [`StoreRegistry::store`](crate::registry::StoreRegistry::store).
/// All operations take the [`CallContext`] of the calling execution unit.
///
/// # Example
///
/// ```
/// use lifescope_store::prelude::*;
///
/// struct PerRequest;
///
/// #[derive(Clone, Debug, PartialEq)]
/// struct User(&'static str);
/// impl ScopedValue for User {}
///
/// let registry = StoreRegistry::new();
/// let store = registry.store::<PerRequest>();
/// let ctx = CallContext::new();
/// let key = ScopeKey::unique();
///
/// // Outside a scope every operation fails
/// assert!(matches!(
///     store.get_or_add(&ctx, key, |_| User("alice")),
///     Err(ScopeError::NotOpen { .. })
/// ));
///
/// store.open_scope(&ctx).unwrap();
/// assert_eq!(store.get_or_add(&ctx, key, |_| User("alice")).unwrap(), User("alice"));
/// // The factory only runs once per scope
/// assert_eq!(store.get_or_add(&ctx, key, |_| User("bob")).unwrap(), User("alice"));
///
/// assert_eq!(store.close_scope(&ctx).unwrap(), 1);
/// assert!(!ctx.is_open::<PerRequest>());
/// ```
pub struct ScopeStore<T: ScopeContext> {
    key: ContextKey,
    lock: ReentrantMutex<()>,
    leaks: Arc<LeakTracker>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: ScopeContext> ScopeStore<T> {
    pub(crate) fn new(leaks: Arc<LeakTracker>) -> Self {
        Self {
            key: ContextKey::of::<T>(),
            lock: ReentrantMutex::new(()),
            leaks,
            _marker: PhantomData,
        }
    }

    /// Returns the key of this store's context type.
    #[must_use]
    pub fn context_key(&self) -> ContextKey {
        self.key
    }

    /// Returns the name of this store's context type.
    #[must_use]
    pub fn context_name(&self) -> &'static str {
        self.key.name()
    }

    /// Returns `true` if a scope of this context type is visible in `ctx`.
    #[must_use]
    pub fn is_open(&self, ctx: &CallContext) -> bool {
        ctx.open_state(&self.key).is_some()
    }

    /// Opens a new, empty scope in `ctx`.
    ///
    /// The scope is visible through every clone of `ctx`. Forks taken from
    /// `ctx` afterwards inherit it; forks taken before do not.
    ///
    /// # Errors
    ///
    /// [`ScopeError::AlreadyOpen`] if `ctx` already carries an open scope of
    /// this context type, whether opened here or inherited from an ancestor.
    pub fn open_scope(&self, ctx: &CallContext) -> Result<ScopeId, ScopeError> {
        let _guard = self.lock.lock();
        self.verify_closed(ctx)?;

        let state = Arc::new(ScopeState::new(self.key, Arc::clone(&self.leaks)));
        let id = state.id();
        if !ctx.install(self.key, Arc::clone(&state)) {
            // Lost to another registry's store of the same context type.
            state.mark_closed();
            return Err(self.already_open());
        }

        tracing::debug!(context = self.key.name(), scope = %id, "lifetime scope opened");
        Ok(id)
    }

    /// Closes the scope visible in `ctx` and disposes every cached value.
    ///
    /// The scope is marked closed and retracted from `ctx` before any value is
    /// disposed, so every fork that inherited it observes it closed from then
    /// on. Returns the number of values disposed.
    ///
    /// Every value is disposed even if one of them panics; the first panic is
    /// resumed once the rest are done.
    ///
    /// # Errors
    ///
    /// [`ScopeError::NotOpen`] if no scope of this context type is visible.
    pub fn close_scope(&self, ctx: &CallContext) -> Result<usize, ScopeError> {
        let _guard = self.lock.lock();
        let state = self.verify_open(ctx)?;
        Ok(self.close_state(ctx, &state))
    }

    /// Closes scope `id` if it is still the one visible in `ctx`.
    pub(crate) fn close_owned(
        &self,
        ctx: &CallContext,
        id: ScopeId,
    ) -> Result<usize, ScopeError> {
        let _guard = self.lock.lock();
        let state = self.verify_open(ctx)?;
        if state.id() != id {
            return Err(self.not_open());
        }
        Ok(self.close_state(ctx, &state))
    }

    fn close_state(&self, ctx: &CallContext, state: &ScopeState) -> usize {
        state.mark_closed();
        ctx.retract(&self.key, state.id());

        let values = state.drain();
        let disposed = values.len();
        let mut first_panic = None;
        for value in values {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| value.dispose())) {
                first_panic.get_or_insert(payload);
            }
        }

        tracing::debug!(
            context = self.key.name(),
            scope = %state.id(),
            disposed,
            "lifetime scope closed"
        );

        if let Some(payload) = first_panic {
            tracing::warn!(
                context = self.key.name(),
                scope = %state.id(),
                "scoped value panicked while disposed"
            );
            panic::resume_unwind(payload);
        }
        disposed
    }

    /// Returns the value cached under `key`, creating it with `factory` if
    /// absent.
    ///
    /// `factory` runs at most once per key per scope, under the store lock.
    /// If a reentrant factory stored `key` itself, the stored value wins and
    /// the freshly built one is disposed.
    ///
    /// # Errors
    ///
    /// - [`ScopeError::NotOpen`] if no scope of this context type is visible
    /// - [`ScopeError::TypeMismatch`] if `key` holds a value that is not a `V`
    pub fn get_or_add<V, F>(
        &self,
        ctx: &CallContext,
        key: ScopeKey,
        factory: F,
    ) -> Result<V, ScopeError>
    where
        V: ScopedValue + Clone,
        F: FnOnce(ScopeKey) -> V,
    {
        let _guard = self.lock.lock();
        let state = self.verify_open(ctx)?;

        if let Some(existing) = self.lookup::<V>(&state, key)? {
            tracing::trace!(context = self.key.name(), %key, "scope cache hit");
            return Ok(existing);
        }

        tracing::trace!(context = self.key.name(), %key, "scope cache miss");
        let value = factory(key);

        // A reentrant factory may have closed the scope.
        if !state.is_open() {
            value.dispose();
            return Err(self.not_open());
        }

        let existing = {
            let mut entries = state.entries.lock();
            match entries.entry(key) {
                Entry::Vacant(slot) => {
                    slot.insert(Box::new(value.clone()));
                    return Ok(value);
                }
                Entry::Occupied(slot) => slot.get().downcast_ref::<V>().cloned(),
            }
        };

        value.dispose();
        existing.ok_or_else(|| self.type_mismatch::<V>())
    }

    /// Removes the value cached under `key` without disposing it.
    ///
    /// Returns whether a value was present.
    ///
    /// # Errors
    ///
    /// [`ScopeError::NotOpen`] if no scope of this context type is visible.
    pub fn try_remove(&self, ctx: &CallContext, key: ScopeKey) -> Result<bool, ScopeError> {
        let _guard = self.lock.lock();
        let state = self.verify_open(ctx)?;

        let removed = state.entries.lock().remove(&key).is_some();
        tracing::trace!(context = self.key.name(), %key, removed, "scope entry removed");
        Ok(removed)
    }

    /// Removes the value cached under `key` if it is a `V` accepted by
    /// `predicate`, and returns it without disposing it.
    ///
    /// `predicate` runs while the scope's cache is locked and must not call
    /// back into the store.
    ///
    /// # Errors
    ///
    /// [`ScopeError::NotOpen`] if no scope of this context type is visible.
    pub fn remove_if<V, P>(
        &self,
        ctx: &CallContext,
        key: ScopeKey,
        predicate: P,
    ) -> Result<Option<V>, ScopeError>
    where
        V: ScopedValue,
        P: FnOnce(&V) -> bool,
    {
        let _guard = self.lock.lock();
        let state = self.verify_open(ctx)?;

        let mut entries = state.entries.lock();
        let matches = entries
            .get(&key)
            .and_then(|value| value.downcast_ref::<V>())
            .is_some_and(predicate);
        if !matches {
            return Ok(None);
        }

        Ok(entries
            .remove(&key)
            .and_then(|value| value.downcast::<V>().ok())
            .map(|boxed| *boxed))
    }

    /// Returns `true` if a value is cached under `key`.
    ///
    /// # Errors
    ///
    /// [`ScopeError::NotOpen`] if no scope of this context type is visible.
    pub fn contains(&self, ctx: &CallContext, key: ScopeKey) -> Result<bool, ScopeError> {
        let _guard = self.lock.lock();
        let state = self.verify_open(ctx)?;
        let contains = state.entries.lock().contains_key(&key);
        Ok(contains)
    }

    /// Returns the number of values cached in the scope visible in `ctx`.
    ///
    /// # Errors
    ///
    /// [`ScopeError::NotOpen`] if no scope of this context type is visible.
    pub fn len(&self, ctx: &CallContext) -> Result<usize, ScopeError> {
        let _guard = self.lock.lock();
        let state = self.verify_open(ctx)?;
        let len = state.entries.lock().len();
        Ok(len)
    }

    fn lookup<V>(&self, state: &ScopeState, key: ScopeKey) -> Result<Option<V>, ScopeError>
    where
        V: ScopedValue + Clone,
    {
        let entries = state.entries.lock();
        match entries.get(&key) {
            None => Ok(None),
            Some(value) => value
                .downcast_ref::<V>()
                .cloned()
                .map(Some)
                .ok_or_else(|| self.type_mismatch::<V>()),
        }
    }

    fn verify_open(&self, ctx: &CallContext) -> Result<Arc<ScopeState>, ScopeError> {
        ctx.open_state(&self.key).ok_or_else(|| self.not_open())
    }

    fn verify_closed(&self, ctx: &CallContext) -> Result<(), ScopeError> {
        match ctx.open_state(&self.key) {
            Some(_) => Err(self.already_open()),
            None => Ok(()),
        }
    }

    fn already_open(&self) -> ScopeError {
        ScopeError::AlreadyOpen {
            context: self.key.name(),
        }
    }

    fn not_open(&self) -> ScopeError {
        ScopeError::NotOpen {
            context: self.key.name(),
        }
    }

    fn type_mismatch<V>(&self) -> ScopeError {
        ScopeError::TypeMismatch {
            context: self.key.name(),
            expected: core::any::type_name::<V>(),
        }
    }
}

impl<T: ScopeContext> fmt::Debug for ScopeStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeStore")
            .field("context", &self.key.name())
            .finish_non_exhaustive()
    }
}
