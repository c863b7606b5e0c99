//! Resource ownership and lifetime tracking.
//!
//! Everything an execution context creates on behalf of extension code
//! (routes, subscriptions, timers, services) is a [`Resource`]. A resource
//! carries an explicit reference count separate from the `Arc` that keeps
//! its memory alive: the class destroy function runs when the count drops
//! to zero or when the resource is destroyed explicitly, and never twice.
//!
//! A *rooted* resource is owned by its context and torn down at unload. A
//! transient one lives only as long as callers hold references to it.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::context::{Context, ContextInner, ContextState};
use crate::error::PluginError;

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Static descriptor shared by every resource of one kind.
#[derive(Debug)]
pub struct ResourceClass {
    pub name: &'static str,
    /// Tears down class-specific state. Runs at most once per resource.
    pub destroy: fn(&Resource),
    /// Size of the payload, reported in diagnostics.
    pub size: usize,
}

pub(crate) struct ResourceInner {
    id: u64,
    class: &'static ResourceClass,
    owner: Weak<ContextInner>,
    refcount: AtomicUsize,
    rooted: AtomicBool,
    destroyed: AtomicBool,
    payload: Box<dyn Any + Send + Sync>,
}

/// Handle to a resource. Cloning the handle does not retain the resource.
#[derive(Clone)]
pub struct Resource(Arc<ResourceInner>);

/// Non-owning handle, used by payloads that need to find their own resource.
#[derive(Clone, Default)]
pub struct WeakResource(Weak<ResourceInner>);

impl WeakResource {
    pub fn upgrade(&self) -> Option<Resource> {
        self.0.upgrade().map(Resource)
    }
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.0.id)
            .field("class", &self.0.class.name)
            .field("refcount", &self.refcount())
            .field("rooted", &self.is_rooted())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl Resource {
    /// Allocate a transient resource owned by `ctx`, with one reference
    /// held by the caller.
    pub fn alloc<T>(class: &'static ResourceClass, ctx: &Context, payload: T) -> Resource
    where
        T: Any + Send + Sync,
    {
        let resource = Resource(Arc::new(ResourceInner {
            id: NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed),
            class,
            owner: ctx.downgrade(),
            refcount: AtomicUsize::new(1),
            rooted: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            payload: Box::new(payload),
        }));
        tracing::trace!(
            plugin = %ctx.id(),
            resource = %class.name,
            id = resource.id(),
            "resource allocated"
        );
        resource
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn class(&self) -> &'static ResourceClass {
        self.0.class
    }

    pub fn refcount(&self) -> usize {
        self.0.refcount.load(Ordering::Acquire)
    }

    pub fn is_rooted(&self) -> bool {
        self.0.rooted.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.0.destroyed.load(Ordering::Acquire)
    }

    pub fn is_same(&self, other: &Resource) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// The owning context, while it is still alive.
    pub fn context(&self) -> Option<Context> {
        Context::upgrade(&self.0.owner)
    }

    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.0.payload.downcast_ref::<T>()
    }

    pub fn downgrade(&self) -> WeakResource {
        WeakResource(Arc::downgrade(&self.0))
    }

    pub fn retain(&self) {
        self.0.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reference. The thread that takes the count to zero unlinks
    /// the resource and runs the destroy function.
    pub fn release(&self) -> Result<(), PluginError> {
        let prev = self
            .0
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match prev {
            Err(_) => {
                tracing::error!(
                    resource = %self.0.class.name,
                    id = self.0.id,
                    "resource released past zero"
                );
                Err(PluginError::DoubleDestroy {
                    class: self.0.class.name,
                    id: self.0.id,
                })
            }
            Ok(1) => {
                self.finalize();
                Ok(())
            }
            Ok(_) => Ok(()),
        }
    }

    /// Hand the caller's reference over to the owning context.
    ///
    /// Fails once the context has started unloading; the caller keeps its
    /// reference in that case.
    pub fn root(&self) -> Result<(), PluginError> {
        let ctx = self
            .context()
            .ok_or_else(|| PluginError::InvalidState("owning context is gone".into()))?;
        let mut resources = ctx.inner().resources();
        let state = ctx.state();
        if matches!(state, ContextState::Unloading | ContextState::Destroyed) {
            return Err(PluginError::InvalidState(format!(
                "cannot root a {} in context '{}' while it is {state}",
                self.0.class.name,
                ctx.id()
            )));
        }
        if self.is_destroyed() {
            return Err(PluginError::InvalidState(format!(
                "{} resource #{} is already destroyed",
                self.0.class.name, self.0.id
            )));
        }
        if !self.0.rooted.swap(true, Ordering::AcqRel) {
            resources.push(self.clone());
        }
        Ok(())
    }

    /// Remove the resource from its context's owned set without destroying
    /// it. Returns whether it was rooted; if so the context's reference now
    /// belongs to the caller.
    pub fn unlink(&self) -> bool {
        if !self.0.rooted.swap(false, Ordering::AcqRel) {
            return false;
        }
        if let Some(ctx) = self.context() {
            ctx.inner()
                .resources()
                .retain(|r| !Arc::ptr_eq(&r.0, &self.0));
        }
        true
    }

    /// Tear the resource down now, regardless of outstanding references.
    pub fn destroy(&self) {
        if self.0.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let was_rooted = self.unlink();
        tracing::debug!(resource = %self.0.class.name, id = self.0.id, "resource destroyed");
        (self.0.class.destroy)(self);
        if was_rooted {
            let _ = self.release();
        }
    }

    fn finalize(&self) {
        self.unlink();
        if self.0.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(resource = %self.0.class.name, id = self.0.id, "resource released");
        (self.0.class.destroy)(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::detached_context;
    use std::sync::atomic::AtomicUsize;

    static COUNTED_DESTROYS: AtomicUsize = AtomicUsize::new(0);

    fn count_destroy(_: &Resource) {
        COUNTED_DESTROYS.fetch_add(1, Ordering::SeqCst);
    }

    static COUNTED: ResourceClass = ResourceClass {
        name: "counted",
        destroy: count_destroy,
        size: 0,
    };

    fn noop(_: &Resource) {}

    static PLAIN: ResourceClass = ResourceClass {
        name: "plain",
        destroy: noop,
        size: std::mem::size_of::<u32>(),
    };

    #[test]
    fn test_alloc_starts_with_one_reference() {
        let ctx = detached_context("alloc");
        let r = Resource::alloc(&PLAIN, &ctx, 5u32);
        assert_eq!(r.refcount(), 1);
        assert!(!r.is_rooted());
        assert_eq!(r.payload::<u32>(), Some(&5));
        assert!(r.payload::<String>().is_none());
        assert!(r.context().unwrap().is_same(&ctx));
    }

    #[test]
    fn test_retain_release_balance() {
        let ctx = detached_context("balance");
        let before = COUNTED_DESTROYS.load(Ordering::SeqCst);
        let r = Resource::alloc(&COUNTED, &ctx, ());
        for _ in 0..4 {
            r.retain();
        }
        for _ in 0..4 {
            r.release().unwrap();
        }
        assert!(!r.is_destroyed());
        assert_eq!(r.refcount(), 1);

        r.release().unwrap();
        assert!(r.is_destroyed());
        assert_eq!(COUNTED_DESTROYS.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn test_release_past_zero_is_reported() {
        let ctx = detached_context("double");
        let r = Resource::alloc(&PLAIN, &ctx, ());
        r.release().unwrap();
        let err = r.release().unwrap_err();
        assert!(matches!(err, PluginError::DoubleDestroy { class: "plain", .. }));
    }

    #[test]
    fn test_concurrent_release_destroys_once() {
        static RACED: AtomicUsize = AtomicUsize::new(0);
        fn raced(_: &Resource) {
            RACED.fetch_add(1, Ordering::SeqCst);
        }
        static RACE_CLASS: ResourceClass = ResourceClass {
            name: "race",
            destroy: raced,
            size: 0,
        };

        let ctx = detached_context("race");
        let r = Resource::alloc(&RACE_CLASS, &ctx, ());
        for _ in 0..7 {
            r.retain();
        }
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = r.clone();
                std::thread::spawn(move || r.release().unwrap())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(RACED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_destroy_releases_root_reference_once() {
        static TORN: AtomicUsize = AtomicUsize::new(0);
        fn torn(_: &Resource) {
            TORN.fetch_add(1, Ordering::SeqCst);
        }
        static TORN_CLASS: ResourceClass = ResourceClass {
            name: "torn",
            destroy: torn,
            size: 0,
        };

        let ctx = detached_context("destroy-race");
        for round in 0..50 {
            let r = Resource::alloc(&TORN_CLASS, &ctx, ());
            r.root().unwrap();
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let r = r.clone();
                    std::thread::spawn(move || r.destroy())
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
            assert_eq!(TORN.load(Ordering::SeqCst), round + 1);
            assert_eq!(r.refcount(), 0);
            assert!(!r.is_rooted());
        }
        assert_eq!(ctx.resource_count(), 0);
    }

    #[test]
    fn test_root_and_unlink() {
        let ctx = detached_context("root");
        let r = Resource::alloc(&PLAIN, &ctx, ());
        r.root().unwrap();
        assert!(r.is_rooted());
        assert_eq!(ctx.resource_count(), 1);

        assert!(r.unlink());
        assert!(!r.unlink());
        assert_eq!(ctx.resource_count(), 0);
        assert!(!r.is_destroyed());
        assert_eq!(r.refcount(), 1);
    }

    #[test]
    fn test_destroy_runs_once_and_unlinks() {
        static ONCE: AtomicUsize = AtomicUsize::new(0);
        fn once(_: &Resource) {
            ONCE.fetch_add(1, Ordering::SeqCst);
        }
        static ONCE_CLASS: ResourceClass = ResourceClass {
            name: "once",
            destroy: once,
            size: 0,
        };

        let ctx = detached_context("destroy");
        let r = Resource::alloc(&ONCE_CLASS, &ctx, ());
        r.root().unwrap();
        r.retain();

        r.destroy();
        r.destroy();
        assert_eq!(ONCE.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.resource_count(), 0);

        // the extra reference outlives the teardown without a second destroy
        assert_eq!(r.refcount(), 1);
        r.release().unwrap();
        assert_eq!(ONCE.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_root_rejected_after_destroy() {
        let ctx = detached_context("late-root");
        let r = Resource::alloc(&PLAIN, &ctx, ());
        r.destroy();
        assert!(matches!(r.root(), Err(PluginError::InvalidState(_))));
    }
}
