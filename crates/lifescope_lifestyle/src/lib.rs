//! Per-lifetime-scope lifestyle for dependency-injection containers (Layer 2).
//!
//! `lifescope_lifestyle` builds "one instance per open scope" on top of
//! [`lifescope_store`]:
//!
//! - [`lifestyle`] - [`ScopedLifestyle`], the resolution-cache adapter
//! - [`instance`] - [`CachedInstance`], the wrapper that ties a cached
//!   instance to its release path
//!
//! A container keeps one [`ScopedLifestyle`] per registration. It calls
//! [`resolve`](ScopedLifestyle::resolve) with its own build function and
//! [`release`](ScopedLifestyle::release) when a caller hands an instance
//! back. Instances still cached when the scope closes are released
//! automatically, exactly once.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use lifescope_lifestyle::ScopedLifestyle;
//! use lifescope_store::prelude::*;
//!
//! struct PerRequest;
//! struct Repository;
//!
//! let registry = StoreRegistry::new();
//! let lifestyle = ScopedLifestyle::<PerRequest, Repository>::from_registry(
//!     &registry,
//!     |_repo| true, // the container's destroy path
//! );
//!
//! let scope = LifetimeScope::<PerRequest>::open(&registry, &CallContext::new()).unwrap();
//! let a = lifestyle.resolve(scope.context(), || Arc::new(Repository)).unwrap();
//! let b = lifestyle.resolve(scope.context(), || Arc::new(Repository)).unwrap();
//! assert!(Arc::ptr_eq(&a, &b));
//! ```

/// Cached instance wrapper.
pub mod instance;

/// The resolution-cache adapter.
pub mod lifestyle;

pub use instance::{CachedInstance, ReleaseFn};
pub use lifestyle::ScopedLifestyle;
