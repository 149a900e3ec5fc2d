//! A tiny dependency-injection container used to exercise the lifestyle the
//! way a real container drives it.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lifescope_lifestyle::ScopedLifestyle;
use lifescope_store::prelude::*;
use parking_lot::Mutex;

/// A leaf service that counts how often it was disposed.
#[derive(Debug, Default)]
pub struct SimpleService {
    disposed: AtomicUsize,
}

impl SimpleService {
    pub fn times_disposed(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn dispose(&self) {
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

/// A service with one dependency.
#[derive(Debug)]
pub struct CompositeService {
    pub simple: Arc<SimpleService>,
}

/// Whether the container remembers what it handed out.
///
/// A tracking container forwards `release` to the component's lifestyle; a
/// non-tracking one has nothing to forward and ignores the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleasePolicy {
    Tracking,
    NoTracking,
}

/// One component registered with a per-scope lifestyle.
pub struct Registration<T: ScopeContext, C: Send + Sync + 'static> {
    lifestyle: ScopedLifestyle<T, C>,
    policy: ReleasePolicy,
    tracked: Mutex<Vec<Arc<C>>>,
}

impl<T: ScopeContext, C: Send + Sync + 'static> Registration<T, C> {
    pub fn new(registry: &StoreRegistry, policy: ReleasePolicy, destroy: fn(&C)) -> Self {
        Self {
            lifestyle: ScopedLifestyle::from_registry(registry, move |instance: &Arc<C>| {
                destroy(instance);
                true
            }),
            policy,
            tracked: Mutex::new(Vec::new()),
        }
    }

    pub fn resolve_with<F>(&self, ctx: &CallContext, build: F) -> Result<Arc<C>, ScopeError>
    where
        F: FnOnce() -> Arc<C>,
    {
        let instance = self.lifestyle.resolve(ctx, build)?;
        if self.policy == ReleasePolicy::Tracking {
            let mut tracked = self.tracked.lock();
            if !tracked.iter().any(|t| Arc::ptr_eq(t, &instance)) {
                tracked.push(Arc::clone(&instance));
            }
        }
        Ok(instance)
    }

    /// Returns `true` if the lifestyle was asked to release `instance`.
    pub fn release(&self, ctx: &CallContext, instance: &Arc<C>) -> Result<bool, ScopeError> {
        if self.policy == ReleasePolicy::NoTracking {
            return Ok(false);
        }
        {
            let mut tracked = self.tracked.lock();
            let Some(pos) = tracked.iter().position(|t| Arc::ptr_eq(t, instance)) else {
                return Ok(false);
            };
            tracked.swap_remove(pos);
        }
        self.lifestyle.release(ctx, instance)
    }
}

/// A container with a scoped `SimpleService` under context `A` and a scoped
/// `CompositeService` under context `B`.
pub struct Container<A: ScopeContext, B: ScopeContext> {
    pub simple: Registration<A, SimpleService>,
    pub composite: Registration<B, CompositeService>,
}

impl<A: ScopeContext, B: ScopeContext> Container<A, B> {
    pub fn new(registry: &StoreRegistry, policy: ReleasePolicy) -> Self {
        Self {
            simple: Registration::new(registry, policy, SimpleService::dispose),
            composite: Registration::new(registry, policy, |_| {}),
        }
    }

    pub fn resolve_simple(&self, ctx: &CallContext) -> Result<Arc<SimpleService>, ScopeError> {
        self.simple
            .resolve_with(ctx, || Arc::new(SimpleService::default()))
    }

    /// Resolves the composite, wiring its dependency through `simple`.
    pub fn resolve_composite(
        &self,
        ctx: &CallContext,
    ) -> Result<Arc<CompositeService>, ScopeError> {
        let simple = self.resolve_simple(ctx)?;
        self.composite
            .resolve_with(ctx, || Arc::new(CompositeService { simple }))
    }

    /// Resolves the composite, wiring it to a container-wide singleton.
    pub fn resolve_composite_with(
        &self,
        ctx: &CallContext,
        singleton: &Arc<SimpleService>,
    ) -> Result<Arc<CompositeService>, ScopeError> {
        let simple = Arc::clone(singleton);
        self.composite
            .resolve_with(ctx, || Arc::new(CompositeService { simple }))
    }
}
