//! Contextual lifetime scopes for Rust.
//!
//! A lifetime scope is a per-call-graph object cache: open one, and every
//! thread or task forked from inside it shares the same cached values until
//! the scope closes and disposes them.
//!
//! - [`store`] - scope store, call context, registry and scope handle
//! - [`lifestyle`] - "one instance per open scope" for DI containers

pub use lifescope_lifestyle as lifestyle;
pub use lifescope_store as store;

/// Re-export all common types for easy access.
pub mod prelude {
    pub use lifescope_lifestyle::{CachedInstance, ReleaseFn, ScopedLifestyle};
    pub use lifescope_store::prelude::*;
}
