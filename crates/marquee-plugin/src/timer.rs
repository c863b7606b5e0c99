//! Timers: deferred calls into a context from a dedicated thread.

use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::thread;
use std::time::Duration;

use crate::context::{Context, ContextInner, ContextState};
use crate::engine::ScriptFn;
use crate::error::PluginError;
use crate::resource::{Resource, ResourceClass, WeakResource};

pub static TIMER_CLASS: ResourceClass = ResourceClass {
    name: "timer",
    destroy: destroy_timer,
    size: std::mem::size_of::<TimerPayload>(),
};

struct TimerPayload {
    signal: Arc<CancelSignal>,
}

fn destroy_timer(resource: &Resource) {
    if let Some(payload) = resource.payload::<TimerPayload>() {
        payload.signal.cancel();
    }
}

#[derive(Default)]
struct CancelSignal {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

impl CancelSignal {
    fn cancel(&self) {
        *self.cancelled.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.wake.notify_all();
    }

    fn is_cancelled(&self) -> bool {
        *self.cancelled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sleep for `delay` unless cancelled first. Returns true if cancelled.
    fn wait(&self, delay: Duration) -> bool {
        let guard = self.cancelled.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .wake
            .wait_timeout_while(guard, delay, |cancelled| !*cancelled)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

struct TimerTask {
    signal: Arc<CancelSignal>,
    ctx: Weak<ContextInner>,
    resource: WeakResource,
    delay: Duration,
    handler: ScriptFn,
    repeat: bool,
}

impl TimerTask {
    fn run(self) {
        loop {
            if self.signal.wait(self.delay) {
                return;
            }
            let Some(ctx) = Context::upgrade(&self.ctx) else {
                return;
            };
            let guard = ctx.begin();
            if self.signal.is_cancelled() {
                return;
            }
            match ctx.state() {
                ContextState::Running => {}
                ContextState::Created | ContextState::Initializing => continue,
                _ => return,
            }
            if let Err(e) = guard.call(self.handler, &[]) {
                tracing::warn!(plugin = %ctx.id(), "timer handler failed: {e}");
            }
            if !self.repeat {
                if let Some(resource) = self.resource.upgrade() {
                    resource.destroy();
                }
                return;
            }
        }
    }
}

/// Start a timer owned by `ctx`.
pub(crate) fn set_timeout(
    ctx: &Context,
    delay: Duration,
    handler: ScriptFn,
    repeat: bool,
) -> Result<Resource, PluginError> {
    let signal = Arc::new(CancelSignal::default());
    let resource = Resource::alloc(
        &TIMER_CLASS,
        ctx,
        TimerPayload {
            signal: signal.clone(),
        },
    );
    if let Err(e) = resource.root() {
        let _ = resource.release();
        return Err(e);
    }

    let task = TimerTask {
        signal,
        ctx: ctx.downgrade(),
        resource: resource.downgrade(),
        delay,
        handler,
        repeat,
    };
    let spawned = thread::Builder::new()
        .name(format!("timer-{}-{}", ctx.id(), resource.id()))
        .spawn(move || task.run());
    if let Err(e) = spawned {
        resource.destroy();
        return Err(e.into());
    }
    tracing::debug!(
        plugin = %ctx.id(),
        id = resource.id(),
        delay_ms = delay.as_millis() as u64,
        repeat,
        "timer started"
    );
    Ok(resource)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::context_with;
    use crate::context::Entrypoint;
    use crate::engine::ScriptValue;
    use crate::native::NativeEngine;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Instant;

    fn timer_context(id: &str, delay_ms: u64, repeat: bool) -> (Context, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel();
        let tx = Arc::new(Mutex::new(tx));
        let engine = NativeEngine::new();
        engine.register_module(id, move |scope, _| {
            let tx = tx.clone();
            let h = scope.function(move |_, _| {
                let _ = tx.lock().unwrap().send(());
                Ok(ScriptValue::Undefined)
            });
            scope
                .host()
                .set_timeout(Duration::from_millis(delay_ms), h, repeat)?;
            Ok(ScriptValue::Undefined)
        });
        let ctx = context_with(id, engine);
        ctx.load(Entrypoint::new("main", id)).unwrap();
        (ctx, rx)
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_one_shot_fires_once_and_destroys_itself() {
        let (ctx, rx) = timer_context("once", 10, false);
        assert_eq!(ctx.resource_count(), 1);
        rx.recv_timeout(Duration::from_secs(5)).expect("timer never fired");
        assert!(wait_until(|| ctx.resource_count() == 0));
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_repeating_timer_fires_until_unload() {
        let (ctx, rx) = timer_context("repeat", 5, true);
        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(5)).expect("timer stalled");
        }
        ctx.unload().unwrap();
        while rx.try_recv().is_ok() {}
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let engine = NativeEngine::new();
        let f = fired.clone();
        engine.register_module("cancel", move |scope, _| {
            let f = f.clone();
            let h = scope.function(move |_, _| {
                f.fetch_add(1, Ordering::SeqCst);
                Ok(ScriptValue::Undefined)
            });
            let timer = scope
                .host()
                .set_timeout(Duration::from_millis(20), h, false)?;
            scope.host().destroy_resource(&timer);
            Ok(ScriptValue::Undefined)
        });
        let ctx = context_with("cancel", engine);
        ctx.load(Entrypoint::new("main", "cancel")).unwrap();
        assert_eq!(ctx.resource_count(), 0);
        thread::sleep(Duration::from_millis(80));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_wait_returns_early_on_cancel() {
        let signal = Arc::new(CancelSignal::default());
        let s = signal.clone();
        let start = Instant::now();
        let handle = thread::spawn(move || s.wait(Duration::from_secs(30)));
        thread::sleep(Duration::from_millis(20));
        signal.cancel();
        assert!(handle.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
