//! The contextual lifetime-scope store for lifescope (Layer 1).
//!
//! `lifescope_store` lets unrelated call sites share one cache of objects for
//! the duration of a logical operation:
//!
//! - [`context`] - Context type tags and their stable keys
//! - [`call_context`] - The propagating slot carried along a call graph
//! - [`value`] - Cache keys and the disposal contract for stored values
//! - [`store`] - The per-context-type scope store
//! - [`registry`] - The registry that owns one store per context type
//! - [`handle`] - RAII scope handle (open on construction, close on drop)
//!
//! # Architecture
//!
//! - **Layer 1** (`lifescope_store`): scope store and propagation (this crate)
//! - **Layer 2** (`lifescope_lifestyle`): "one instance per open scope" adapter
//!   for dependency-injection containers
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use lifescope_store::prelude::*;
//!
//! struct PerRequest;
//!
//! #[derive(Clone)]
//! struct RequestId(u64);
//! impl ScopedValue for RequestId {}
//!
//! let registry = StoreRegistry::new();
//! let root = CallContext::new();
//!
//! let scope = LifetimeScope::<PerRequest>::open(&registry, &root).unwrap();
//! let key = ScopeKey::unique();
//!
//! let id = scope
//!     .store()
//!     .get_or_add(scope.context(), key, |_| RequestId(7))
//!     .unwrap();
//! assert_eq!(id.0, 7);
//!
//! // A child thread forked inside the scope sees the same cache.
//! let store = Arc::clone(scope.store());
//! let seen = scope
//!     .context()
//!     .spawn(move |ctx| store.get_or_add(&ctx, key, |_| RequestId(0)).unwrap().0)
//!     .join()
//!     .unwrap();
//! assert_eq!(seen, 7);
//!
//! scope.close().unwrap();
//! ```

/// Propagating scope slots carried along a logical call graph.
pub mod call_context;

/// Context type tags.
pub mod context;

/// Scope state mismatch errors.
pub mod error;

/// RAII scope handle.
pub mod handle;

/// Store registry and configuration.
pub mod registry;

/// The scope store.
pub mod store;

/// Cache keys and stored values.
pub mod value;

/// Re-export all common types for easy access.
pub mod prelude {
    pub use crate::call_context::*;
    pub use crate::context::*;
    pub use crate::error::*;
    pub use crate::handle::*;
    pub use crate::registry::*;
    pub use crate::store::*;
    pub use crate::value::*;
}
