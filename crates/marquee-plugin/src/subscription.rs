//! Property subscriptions owned by extension code.
//!
//! Property callbacks run with the tree lock held, so they cannot enter
//! an interpreter directly. Each subscription queues its events in a
//! mailbox instead; the mailbox is drained on the mutating thread once that
//! thread holds no runtime lock, calling the handler under the owning
//! context's lock. Only one thread drains a given mailbox at a time, which
//! keeps delivery in mutation order.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use marquee_prop::sync::defer;
use marquee_prop::{Prop, PropEvent, Subscription, SubscriptionOptions};

use crate::context::{Context, ContextInner, ContextState};
use crate::engine::{ScriptFn, ScriptValue};
use crate::error::PluginError;
use crate::resource::{Resource, ResourceClass, WeakResource};

pub static SUBSCRIPTION_CLASS: ResourceClass = ResourceClass {
    name: "subscription",
    destroy: destroy_subscription,
    size: std::mem::size_of::<SubscriptionPayload>(),
};

struct SubscriptionPayload {
    handle: Mutex<Option<Subscription>>,
    mailbox: Arc<Mailbox>,
}

fn destroy_subscription(resource: &Resource) {
    let Some(payload) = resource.payload::<SubscriptionPayload>() else {
        return;
    };
    let handle = payload
        .handle
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if let Some(handle) = handle {
        handle.unsubscribe();
    }
    payload.mailbox.clear();
}

#[derive(Default)]
struct Queue {
    events: VecDeque<PropEvent>,
    draining: bool,
}

struct Mailbox {
    ctx: Weak<ContextInner>,
    handler: ScriptFn,
    resource: OnceLock<WeakResource>,
    queue: Mutex<Queue>,
}

impl Mailbox {
    fn queue(&self) -> std::sync::MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(self: &Arc<Self>, event: PropEvent) {
        {
            let mut q = self.queue();
            q.events.push_back(event);
            if q.draining {
                return;
            }
            q.draining = true;
        }
        let mailbox = self.clone();
        defer(move || mailbox.drain());
    }

    fn clear(&self) {
        self.queue().events.clear();
    }

    fn drain(&self) {
        loop {
            let event = {
                let mut q = self.queue();
                match q.events.pop_front() {
                    Some(event) => event,
                    None => {
                        q.draining = false;
                        return;
                    }
                }
            };
            self.deliver(event);
        }
    }

    fn resource(&self) -> Option<Resource> {
        self.resource.get().and_then(WeakResource::upgrade)
    }

    fn deliver(&self, event: PropEvent) {
        let Some(ctx) = Context::upgrade(&self.ctx) else {
            return;
        };
        let Some(resource) = self.resource() else {
            return;
        };
        let guard = ctx.begin();
        if resource.is_destroyed() {
            return;
        }
        let terminal = matches!(event, PropEvent::Destroyed);
        if ctx.state() == ContextState::Running {
            if let Err(e) = guard.call(self.handler, &event_args(event)) {
                tracing::warn!(plugin = %ctx.id(), "subscription handler failed: {e}");
            }
        }
        // A zombie target never fires again.
        if terminal {
            resource.destroy();
        }
    }
}

/// Handler arguments: the event kind followed by its payload.
fn event_args(event: PropEvent) -> Vec<ScriptValue> {
    let kind = |k: &str| ScriptValue::String(k.to_string());
    let before_arg = |b: Option<Prop>| b.map(ScriptValue::Prop).unwrap_or_default();
    match event {
        PropEvent::Set(value) => vec![kind("set"), value.into()],
        PropEvent::AddChild { child, before } => {
            vec![kind("add"), ScriptValue::Prop(child), before_arg(before)]
        }
        PropEvent::DelChild(child) => vec![kind("del"), ScriptValue::Prop(child)],
        PropEvent::MoveChild { child, before } => {
            vec![kind("move"), ScriptValue::Prop(child), before_arg(before)]
        }
        PropEvent::Action(action) => vec![kind("action"), ScriptValue::String(action)],
        PropEvent::Actions(actions) => vec![
            kind("action"),
            ScriptValue::List(actions.into_iter().map(ScriptValue::String).collect()),
        ],
        PropEvent::Custom { kind: name, payload } => {
            vec![kind("event"), ScriptValue::String(name), payload.into()]
        }
        PropEvent::Destroyed => vec![kind("destroyed")],
    }
}

/// Subscribe `handler` to `prop` on behalf of `ctx`.
///
/// The handler sees one final `destroyed` event when `prop` is destroyed,
/// after which the subscription resource is destroyed too.
pub(crate) fn subscribe(
    ctx: &Context,
    prop: &Prop,
    handler: ScriptFn,
    options: SubscriptionOptions,
) -> Result<Resource, PluginError> {
    let mailbox = Arc::new(Mailbox {
        ctx: ctx.downgrade(),
        handler,
        resource: OnceLock::new(),
        queue: Mutex::new(Queue::default()),
    });
    let resource = Resource::alloc(
        &SUBSCRIPTION_CLASS,
        ctx,
        SubscriptionPayload {
            handle: Mutex::new(None),
            mailbox: mailbox.clone(),
        },
    );
    let _ = mailbox.resource.set(resource.downgrade());
    if let Err(e) = resource.root() {
        let _ = resource.release();
        return Err(e);
    }

    // The prop-level handle is kept in the payload, so dropping it must not
    // unsubscribe.
    let prop_options = SubscriptionOptions {
        auto_destroy: false,
        ..options
    };
    let sink = mailbox.clone();
    let handle = match prop.subscribe(prop_options, move |event| sink.push(event.clone())) {
        Ok(handle) => handle,
        Err(e) => {
            resource.destroy();
            return Err(e.into());
        }
    };
    if let Some(payload) = resource.payload::<SubscriptionPayload>() {
        *payload.handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }
    tracing::debug!(plugin = %ctx.id(), id = resource.id(), "subscription created");
    Ok(resource)
}
