//! Execution contexts.
//!
//! One context per loaded extension. It owns the interpreter heap, the set
//! of rooted resources and a re-entrant lock; every call into the heap
//! happens between [`Context::begin`] and the drop of the returned guard.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Utc};
use marquee_prop::sync::{ReentrantGuard, ReentrantLock};
use serde::Serialize;

use crate::engine::{Interpreter, ScriptEngine, ScriptError, ScriptFn, ScriptValue};
use crate::error::PluginError;
use crate::host::HostApi;
use crate::manager::Shared;
use crate::resource::Resource;

/// Lifecycle state of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextState {
    Created,
    Initializing,
    Running,
    Failed,
    Unloading,
    Destroyed,
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContextState::Created => "created",
            ContextState::Initializing => "initializing",
            ContextState::Running => "running",
            ContextState::Failed => "failed",
            ContextState::Unloading => "unloading",
            ContextState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Extension code a context was loaded from.
#[derive(Debug, Clone)]
pub struct Entrypoint {
    pub name: String,
    pub source: Vec<u8>,
}

impl Entrypoint {
    pub fn new(name: impl Into<String>, source: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }
}

#[derive(Debug)]
struct Status {
    state: ContextState,
    error: Option<String>,
    loaded_at: Option<DateTime<Utc>>,
}

pub(crate) struct ContextInner {
    id: String,
    storage_path: PathBuf,
    refcount: AtomicUsize,
    lock: ReentrantLock,
    engine: Arc<dyn ScriptEngine>,
    interpreter: Mutex<Option<Arc<dyn Interpreter>>>,
    resources: Mutex<Vec<Resource>>,
    status: Mutex<Status>,
    entrypoint: Mutex<Option<Entrypoint>>,
    shared: Arc<Shared>,
}

impl ContextInner {
    pub(crate) fn resources(&self) -> MutexGuard<'_, Vec<Resource>> {
        self.resources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn interpreter(&self) -> Option<Arc<dyn Interpreter>> {
        self.interpreter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Handle to an execution context.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("resources", &self.resource_count())
            .finish_non_exhaustive()
    }
}

/// Exclusive access to a context's interpreter. Dropping it ends the
/// critical section.
pub struct ContextGuard<'a> {
    ctx: &'a Context,
    _lock: ReentrantGuard<'a>,
}

impl ContextGuard<'_> {
    pub fn context(&self) -> &Context {
        self.ctx
    }

    pub fn interpreter(&self) -> Option<Arc<dyn Interpreter>> {
        self.ctx.inner.interpreter()
    }

    /// Call `func` in this context's heap.
    pub fn call(&self, func: ScriptFn, args: &[ScriptValue]) -> Result<ScriptValue, ScriptError> {
        let interp = self
            .interpreter()
            .ok_or_else(|| ScriptError::Throw(format!("context '{}' has no heap", self.ctx.id())))?;
        interp.call(func, args)
    }
}

impl Context {
    /// Allocate a context with a fresh heap from `engine`, in state `Created`.
    pub(crate) fn create(
        id: &str,
        storage_path: &Path,
        engine: Arc<dyn ScriptEngine>,
        shared: Arc<Shared>,
    ) -> Result<Context, PluginError> {
        let ctx = Context {
            inner: Arc::new(ContextInner {
                id: id.to_string(),
                storage_path: storage_path.to_path_buf(),
                refcount: AtomicUsize::new(1),
                lock: ReentrantLock::new(),
                engine: engine.clone(),
                interpreter: Mutex::new(None),
                resources: Mutex::new(Vec::new()),
                status: Mutex::new(Status {
                    state: ContextState::Created,
                    error: None,
                    loaded_at: None,
                }),
                entrypoint: Mutex::new(None),
                shared,
            }),
        };
        let heap = engine.create_heap(HostApi::new(&ctx))?;
        *ctx.inner
            .interpreter
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(heap);
        tracing::debug!(plugin = %id, engine = %engine.name(), "context created");
        Ok(ctx)
    }

    pub(crate) fn upgrade(weak: &Weak<ContextInner>) -> Option<Context> {
        weak.upgrade().map(|inner| Context { inner })
    }

    pub(crate) fn downgrade(&self) -> Weak<ContextInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn inner(&self) -> &ContextInner {
        &self.inner
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.inner.shared
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn storage_path(&self) -> &Path {
        &self.inner.storage_path
    }

    pub fn engine(&self) -> Arc<dyn ScriptEngine> {
        self.inner.engine.clone()
    }

    pub fn state(&self) -> ContextState {
        self.inner.status().state
    }

    /// Text of the error that failed the entrypoint, if any.
    pub fn error(&self) -> Option<String> {
        self.inner.status().error.clone()
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        self.inner.status().loaded_at
    }

    pub fn entrypoint(&self) -> Option<Entrypoint> {
        self.inner
            .entrypoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn resource_count(&self) -> usize {
        self.inner.resources().len()
    }

    pub fn refcount(&self) -> usize {
        self.inner.refcount.load(Ordering::Acquire)
    }

    pub fn is_same(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Block until this thread owns the context.
    pub fn begin(&self) -> ContextGuard<'_> {
        ContextGuard {
            ctx: self,
            _lock: self.inner.lock.lock(),
        }
    }

    pub fn retain(&self) {
        self.inner.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reference. The last one releases the heap if the context was
    /// never unloaded.
    pub fn release(&self) -> Result<(), PluginError> {
        let prev = self
            .inner
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match prev {
            Err(_) => {
                tracing::error!(plugin = %self.inner.id, "context released past zero");
                Err(PluginError::InvalidState(format!(
                    "context '{}' released more times than it was retained",
                    self.inner.id
                )))
            }
            Ok(1) => {
                let heap = self
                    .inner
                    .interpreter
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                if let Some(heap) = heap {
                    tracing::warn!(plugin = %self.inner.id, "context dropped without unload");
                    heap.destroy_heap();
                }
                Ok(())
            }
            Ok(_) => Ok(()),
        }
    }

    fn transition(&self, from: &[ContextState], to: ContextState) -> Result<ContextState, PluginError> {
        let mut status = self.inner.status();
        if !from.contains(&status.state) {
            return Err(PluginError::InvalidState(format!(
                "context '{}' is {}, cannot move to {to}",
                self.inner.id, status.state
            )));
        }
        let prev = status.state;
        status.state = to;
        Ok(prev)
    }

    fn finish_load(&self, outcome: &Result<(), PluginError>) {
        let mut status = self.inner.status();
        match outcome {
            Ok(()) => {
                status.state = ContextState::Running;
                status.error = None;
                status.loaded_at = Some(Utc::now());
            }
            Err(e) => {
                status.state = ContextState::Failed;
                status.error = Some(e.to_string());
            }
        }
    }

    /// Compile and run the entrypoint once.
    ///
    /// On failure the context moves to `Failed`, keeps the error text and
    /// stays registered without serving routes.
    pub fn load(&self, entrypoint: Entrypoint) -> Result<(), PluginError> {
        self.transition(&[ContextState::Created], ContextState::Initializing)?;
        *self
            .inner
            .entrypoint
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(entrypoint.clone());

        let guard = self.begin();
        let outcome = guard
            .interpreter()
            .ok_or_else(|| PluginError::InvalidState(format!("context '{}' has no heap", self.id())))
            .and_then(|interp| {
                let main = interp.compile(&entrypoint.name, &entrypoint.source)?;
                interp.call(main, &[])?;
                Ok(())
            });
        self.finish_load(&outcome);
        drop(guard);

        match &outcome {
            Ok(()) => tracing::info!(
                plugin = %self.inner.id,
                entrypoint = %entrypoint.name,
                resources = self.resource_count(),
                "plugin loaded"
            ),
            Err(e) => tracing::error!(
                plugin = %self.inner.id,
                entrypoint = %entrypoint.name,
                "plugin failed to start: {e}"
            ),
        }
        outcome
    }

    /// Destroy every rooted resource, then the heap.
    ///
    /// Resource destroy functions run with this context still locked and
    /// valid, so they may call back into it.
    pub fn unload(&self) -> Result<(), PluginError> {
        let _guard = self.begin();
        let prev = self.transition(
            &[
                ContextState::Created,
                ContextState::Running,
                ContextState::Failed,
            ],
            ContextState::Unloading,
        )?;

        let mut destroyed = 0usize;
        loop {
            let next = self.inner.resources().last().cloned();
            match next {
                Some(resource) => {
                    resource.destroy();
                    destroyed += 1;
                }
                None => break,
            }
        }

        let heap = self
            .inner
            .interpreter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(heap) = heap {
            heap.destroy_heap();
        }
        self.inner.status().state = ContextState::Destroyed;

        tracing::info!(
            plugin = %self.inner.id,
            from = %prev,
            resources = destroyed,
            "plugin unloaded"
        );
        Ok(())
    }
}
