//! Subscriptions: ordered observers on a single property.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::prop::{tree_lock, Prop, PropEvent, PropNode, PropValue};

/// Callback invoked for every event delivered to a subscription.
pub type PropCallback = Arc<dyn Fn(&PropEvent) + Send + Sync>;

/// Per-subscription delivery options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// Unsubscribe when the [`Subscription`] handle is dropped.
    pub auto_destroy: bool,
    /// Skip the initial replay of the current value and children.
    pub no_initial_update: bool,
    /// Do not deliver `Set(Void)`.
    pub ignore_void: bool,
    /// Deliver `DelChild` before the removed child's subtree is torn down.
    pub early_child_delete: bool,
    /// Deliver action lists as one `Actions` event instead of one `Action` per entry.
    pub action_as_array: bool,
}

impl SubscriptionOptions {
    pub fn auto_destroy(mut self) -> Self {
        self.auto_destroy = true;
        self
    }

    pub fn no_initial_update(mut self) -> Self {
        self.no_initial_update = true;
        self
    }

    pub fn ignore_void(mut self) -> Self {
        self.ignore_void = true;
        self
    }

    pub fn early_child_delete(mut self) -> Self {
        self.early_child_delete = true;
        self
    }

    pub fn action_as_array(mut self) -> Self {
        self.action_as_array = true;
        self
    }
}

pub(crate) struct SubscriberEntry {
    pub(crate) options: SubscriptionOptions,
    callback: PropCallback,
    active: AtomicBool,
}

impl SubscriberEntry {
    pub(crate) fn new(options: SubscriptionOptions, callback: PropCallback) -> Self {
        Self {
            options,
            callback,
            active: AtomicBool::new(true),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn deliver(&self, event: &PropEvent) {
        if !self.is_active() {
            return;
        }
        match event {
            PropEvent::Set(PropValue::Void) if self.options.ignore_void => {}
            PropEvent::Actions(actions) if !self.options.action_as_array => {
                for action in actions {
                    if !self.is_active() {
                        return;
                    }
                    (self.callback)(&PropEvent::Action(action.clone()));
                }
            }
            _ => (self.callback)(event),
        }
    }

    /// Deliver the terminal `Destroyed` event, at most once.
    pub(crate) fn finish(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            (self.callback)(&PropEvent::Destroyed);
        }
    }

    /// Stop delivery without a terminal event. Returns false if already stopped.
    pub(crate) fn cancel(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }
}

/// Handle to a registered subscription.
///
/// Without `auto_destroy` the subscription outlives the handle and stays
/// registered until [`Subscription::unsubscribe`] or until its target is
/// destroyed. With `auto_destroy`, dropping the handle unsubscribes.
pub struct Subscription {
    entry: Arc<SubscriberEntry>,
    target: Weak<PropNode>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("options", &self.entry.options)
            .field("active", &self.entry.is_active())
            .finish_non_exhaustive()
    }
}

impl Subscription {
    pub(crate) fn new(entry: Arc<SubscriberEntry>, target: Weak<PropNode>) -> Self {
        Self { entry, target }
    }

    /// Whether events are still being delivered.
    pub fn is_active(&self) -> bool {
        self.entry.is_active()
    }

    pub fn options(&self) -> SubscriptionOptions {
        self.entry.options
    }

    /// The observed property, unless it has been dropped entirely.
    pub fn target(&self) -> Option<Prop> {
        self.target.upgrade().map(Prop::from_node)
    }

    /// Stop delivery. No callback runs after this returns, except one that
    /// is already executing on another thread.
    pub fn unsubscribe(self) {
        self.release();
    }

    fn release(&self) {
        let _tree = tree_lock();
        if !self.entry.cancel() {
            return;
        }
        if let Some(node) = self.target.upgrade() {
            node.remove_subscriber(&self.entry);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.entry.options.auto_destroy {
            self.release();
        }
    }
}
