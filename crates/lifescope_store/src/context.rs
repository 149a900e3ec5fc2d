//! Context type tags.
//!
//! A context type is a compile-time tag identifying an independent family of
//! scopes ("per request", "per transaction", ...). It is never instantiated;
//! only its type identity and name matter.
//!
//! Two different context types are fully independent: scopes of both may be
//! open at the same time and nest freely.

use core::any::TypeId;
use core::fmt;

/// A type usable as a scope context tag.
///
/// Any `'static` type is a context. Marker structs are the usual choice:
///
/// ```
/// use lifescope_store::context::{ContextKey, ScopeContext};
///
/// struct PerRequest;
/// struct PerTransaction;
///
/// assert_ne!(ContextKey::of::<PerRequest>(), ContextKey::of::<PerTransaction>());
/// assert!(PerRequest::context_name().ends_with("PerRequest"));
/// ```
pub trait ScopeContext: 'static {
    /// Returns the human-readable name used in diagnostics.
    fn context_name() -> &'static str
    where
        Self: Sized,
    {
        core::any::type_name::<Self>()
    }
}

// Blanket implementation for all tag types
impl<T: 'static> ScopeContext for T {}

/// Stable, globally unique identifier derived from a context type.
///
/// Used to address the propagating slot in a [`CallContext`](crate::call_context::CallContext)
/// and to key stores in the [`StoreRegistry`](crate::registry::StoreRegistry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextKey {
    type_id: TypeId,
    name: &'static str,
}

impl ContextKey {
    /// Creates the key for context type `T`.
    #[must_use]
    pub fn of<T: ScopeContext>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            name: T::context_name(),
        }
    }

    /// Returns the underlying `TypeId`.
    #[must_use]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Returns the context type's name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}
