//! RAII scope handle.
//!
//! A [`LifetimeScope`] opens a scope when constructed and closes it when
//! dropped, so the scope is closed on every exit path, including early
//! returns and panics.

use core::fmt;
use std::sync::Arc;
use std::thread;

use crate::call_context::CallContext;
use crate::context::ScopeContext;
use crate::error::ScopeError;
use crate::registry::StoreRegistry;
use crate::store::{ScopeId, ScopeStore};

/// An open scope of context type `T`.
///
/// The scope is open in the parent's [`CallContext`]: the handle keeps a
/// clone of it, so the parent unit carries the scope until the handle is
/// closed or dropped. Child execution units get a [`fork`](Self::fork).
///
/// # Example
///
/// ```
/// use lifescope_store::prelude::*;
///
/// struct PerRequest;
///
/// let registry = StoreRegistry::new();
/// let root = CallContext::new();
///
/// {
///     let scope = LifetimeScope::<PerRequest>::open(&registry, &root).unwrap();
///     assert!(scope.context().is_open::<PerRequest>());
///
///     assert!(root.is_open::<PerRequest>());
///
///     // Scopes of the same context type do not nest
///     assert!(LifetimeScope::<PerRequest>::open(&registry, &root).is_err());
///     assert!(LifetimeScope::<PerRequest>::open(&registry, &scope.fork()).is_err());
/// } // closed here
///
/// assert!(!root.is_open::<PerRequest>());
/// ```
pub struct LifetimeScope<T: ScopeContext> {
    store: Arc<ScopeStore<T>>,
    ctx: CallContext,
    id: ScopeId,
    closed: bool,
}

impl<T: ScopeContext> LifetimeScope<T> {
    /// Opens a scope of `T` in `parent`, using `registry`'s store.
    ///
    /// # Errors
    ///
    /// [`ScopeError::AlreadyOpen`] if `parent` already carries an open scope
    /// of `T`.
    pub fn open(registry: &StoreRegistry, parent: &CallContext) -> Result<Self, ScopeError> {
        Self::open_in(registry.store::<T>(), parent)
    }

    /// Opens a scope of `T` in `parent`, using `store`.
    ///
    /// # Errors
    ///
    /// [`ScopeError::AlreadyOpen`] if `parent` already carries an open scope
    /// of `T`.
    pub fn open_in(store: Arc<ScopeStore<T>>, parent: &CallContext) -> Result<Self, ScopeError> {
        let ctx = parent.clone();
        let id = store.open_scope(&ctx)?;
        Ok(Self {
            store,
            ctx,
            id,
            closed: false,
        })
    }

    /// Returns the context in which this scope is open.
    #[must_use]
    pub fn context(&self) -> &CallContext {
        &self.ctx
    }

    /// Returns a snapshot of the scope's context for a child execution unit.
    #[must_use]
    pub fn fork(&self) -> CallContext {
        self.ctx.fork()
    }

    /// Runs `f` on a new thread inside this scope.
    ///
    /// # Panics
    ///
    /// Panics if the OS fails to create a thread.
    pub fn spawn<F, R>(&self, f: F) -> thread::JoinHandle<R>
    where
        F: FnOnce(CallContext) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.ctx.spawn(f)
    }

    /// Returns the store this scope belongs to.
    #[must_use]
    pub fn store(&self) -> &Arc<ScopeStore<T>> {
        &self.store
    }

    /// Returns the identifier of this scope.
    #[must_use]
    pub fn id(&self) -> ScopeId {
        self.id
    }

    /// Closes the scope now, returning the number of values disposed.
    ///
    /// # Errors
    ///
    /// [`ScopeError::NotOpen`] if the scope was already closed through its
    /// context, for example by a child execution unit.
    pub fn close(mut self) -> Result<usize, ScopeError> {
        self.closed = true;
        self.store.close_owned(&self.ctx, self.id)
    }
}

impl<T: ScopeContext> Drop for LifetimeScope<T> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(error) = self.store.close_owned(&self.ctx, self.id) {
            tracing::warn!(scope = %self.id, %error, "failed to close lifetime scope");
        }
    }
}

impl<T: ScopeContext> fmt::Debug for LifetimeScope<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifetimeScope")
            .field("context", &self.store.context_name())
            .field("id", &self.id)
            .finish()
    }
}
