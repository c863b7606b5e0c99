//! Property nodes and mutation/notification.
//!
//! All mutations take the tree-wide [`ReentrantLock`] and hold it while the
//! affected subscribers run, so two mutations never interleave their
//! callbacks. Per-node state sits behind a short-lived `Mutex` that is never
//! held while a callback runs.

use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::error::PropError;
use crate::subscription::{PropCallback, SubscriberEntry, Subscription, SubscriptionOptions};
use crate::sync::{ReentrantGuard, ReentrantLock};

static TREE_LOCK: ReentrantLock = ReentrantLock::new();

pub(crate) fn tree_lock() -> ReentrantGuard<'static> {
    TREE_LOCK.lock()
}

/// The value held by a property.
///
/// `Directory` is reported for nodes that have (or had) children; such a
/// node may still carry a scalar display value, see [`Prop::display_value`].
#[derive(Debug, Clone, Default, PartialEq)]
pub enum PropValue {
    #[default]
    Void,
    String(String),
    Int(i64),
    Float(f64),
    Directory,
}

impl PropValue {
    pub fn is_void(&self) -> bool {
        matches!(self, PropValue::Void)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl std::fmt::Display for PropValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropValue::Void => write!(f, "<void>"),
            PropValue::String(s) => write!(f, "{s:?}"),
            PropValue::Int(i) => write!(f, "{i}"),
            PropValue::Float(v) => write!(f, "{v}"),
            PropValue::Directory => write!(f, "<dir>"),
        }
    }
}

impl From<&str> for PropValue {
    fn from(s: &str) -> Self {
        PropValue::String(s.to_string())
    }
}

impl From<String> for PropValue {
    fn from(s: String) -> Self {
        PropValue::String(s)
    }
}

impl From<i64> for PropValue {
    fn from(i: i64) -> Self {
        PropValue::Int(i)
    }
}

impl From<i32> for PropValue {
    fn from(i: i32) -> Self {
        PropValue::Int(i64::from(i))
    }
}

impl From<f64> for PropValue {
    fn from(v: f64) -> Self {
        PropValue::Float(v)
    }
}

impl From<bool> for PropValue {
    fn from(b: bool) -> Self {
        PropValue::Int(i64::from(b))
    }
}

/// Events delivered to subscribers.
#[derive(Debug, Clone)]
pub enum PropEvent {
    Set(PropValue),
    AddChild { child: Prop, before: Option<Prop> },
    DelChild(Prop),
    MoveChild { child: Prop, before: Option<Prop> },
    Action(String),
    Actions(Vec<String>),
    Custom { kind: String, payload: PropValue },
    /// Terminal event; nothing is delivered after it.
    Destroyed,
}

/// A one-off notification sent with [`Prop::send_event`].
#[derive(Debug, Clone)]
pub enum Notification {
    Actions(Vec<String>),
    Custom { kind: String, payload: PropValue },
}

pub(crate) struct PropNode {
    name: Option<String>,
    state: Mutex<NodeState>,
}

#[derive(Default)]
struct NodeState {
    value: PropValue,
    directory: bool,
    children: Vec<Prop>,
    parent: Weak<PropNode>,
    subscribers: Vec<Arc<SubscriberEntry>>,
    zombie: bool,
}

impl PropNode {
    fn state(&self) -> MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn remove_subscriber(&self, entry: &Arc<SubscriberEntry>) {
        self.state()
            .subscribers
            .retain(|s| !Arc::ptr_eq(s, entry));
    }
}

/// Handle to a node in the shared property tree.
///
/// Cloning the handle is cheap and does not copy the node. A destroyed node
/// stays valid as a zombie: reads return its last state and mutations fail
/// with [`PropError::Zombie`].
#[derive(Clone)]
pub struct Prop {
    node: Arc<PropNode>,
}

/// Non-owning handle to a node.
#[derive(Clone)]
pub struct WeakProp {
    node: Weak<PropNode>,
}

impl WeakProp {
    pub fn upgrade(&self) -> Option<Prop> {
        self.node.upgrade().map(Prop::from_node)
    }

    /// Identity of the node, equal to [`Prop::node_key`] of its handles.
    pub fn node_key(&self) -> usize {
        self.node.as_ptr() as usize
    }
}

impl std::fmt::Debug for Prop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prop")
            .field("name", &self.node.name)
            .field("zombie", &self.is_zombie())
            .finish_non_exhaustive()
    }
}

impl Prop {
    /// Create a detached node.
    pub fn create_root(name: Option<&str>) -> Self {
        Self::from_node(Arc::new(PropNode {
            name: name.map(str::to_string),
            state: Mutex::new(NodeState::default()),
        }))
    }

    pub(crate) fn from_node(node: Arc<PropNode>) -> Self {
        Self { node }
    }

    pub fn name(&self) -> Option<&str> {
        self.node.name.as_deref()
    }

    pub fn downgrade(&self) -> WeakProp {
        WeakProp {
            node: Arc::downgrade(&self.node),
        }
    }

    /// Identity of the node. Stable while any strong or weak handle exists.
    pub fn node_key(&self) -> usize {
        Arc::as_ptr(&self.node) as usize
    }

    /// Current value; `Directory` for nodes with children.
    pub fn value(&self) -> PropValue {
        let st = self.node.state();
        if st.directory {
            PropValue::Directory
        } else {
            st.value.clone()
        }
    }

    /// The scalar value, also for directories.
    pub fn display_value(&self) -> PropValue {
        self.node.state().value.clone()
    }

    pub fn is_directory(&self) -> bool {
        self.node.state().directory
    }

    pub fn children(&self) -> Vec<Prop> {
        self.node.state().children.clone()
    }

    pub fn child_count(&self) -> usize {
        self.node.state().children.len()
    }

    /// Find a direct child by name.
    pub fn child(&self, name: &str) -> Option<Prop> {
        self.node
            .state()
            .children
            .iter()
            .find(|c| c.name() == Some(name))
            .cloned()
    }

    pub fn parent(&self) -> Option<Prop> {
        self.node.state().parent.upgrade().map(Prop::from_node)
    }

    pub fn is_zombie(&self) -> bool {
        self.node.state().zombie
    }

    pub fn is_same(&self, other: &Prop) -> bool {
        Arc::ptr_eq(&self.node, &other.node)
    }

    pub fn subscriber_count(&self) -> usize {
        self.node.state().subscribers.len()
    }

    fn ensure_alive(&self) -> Result<(), PropError> {
        if self.is_zombie() {
            Err(PropError::Zombie)
        } else {
            Ok(())
        }
    }

    fn snapshot_subscribers(&self) -> Vec<Arc<SubscriberEntry>> {
        self.node.state().subscribers.clone()
    }

    fn notify(&self, event: &PropEvent) {
        for sub in self.snapshot_subscribers() {
            sub.deliver(event);
        }
    }

    /// Replace the scalar value and notify subscribers with `Set`.
    ///
    /// Setting `Directory` turns the node into a directory without touching
    /// its display value.
    pub fn set_value(&self, value: impl Into<PropValue>) -> Result<(), PropError> {
        let value = value.into();
        let _tree = tree_lock();
        {
            let mut st = self.node.state();
            if st.zombie {
                return Err(PropError::Zombie);
            }
            match value {
                PropValue::Directory => st.directory = true,
                ref scalar => st.value = scalar.clone(),
            }
        }
        self.notify(&PropEvent::Set(value));
        Ok(())
    }

    /// Walk (creating as needed) the named path below this node and set the
    /// value of the last element. Returns the node that was set.
    pub fn set_path(&self, path: &[&str], value: impl Into<PropValue>) -> Result<Prop, PropError> {
        let _tree = tree_lock();
        let mut node = self.clone();
        for name in path {
            node = node.create_child(name)?;
        }
        node.set_value(value)?;
        Ok(node)
    }

    /// Return the child called `name`, creating and appending it if absent.
    pub fn create_child(&self, name: &str) -> Result<Prop, PropError> {
        let _tree = tree_lock();
        self.ensure_alive()?;
        if let Some(existing) = self.child(name) {
            return Ok(existing);
        }
        let child = Prop::create_root(Some(name));
        self.add_child(&child)?;
        Ok(child)
    }

    /// Append `child`. A child that already has another parent is moved.
    pub fn add_child(&self, child: &Prop) -> Result<(), PropError> {
        self.insert_child(child, None)
    }

    /// Insert `child` before `before` (a current child), or append when `None`.
    pub fn insert_child(&self, child: &Prop, before: Option<&Prop>) -> Result<(), PropError> {
        let _tree = tree_lock();
        self.ensure_alive()?;
        child.ensure_alive()?;
        if self.is_same(child) || child.is_ancestor_of(self) {
            return Err(PropError::Cycle);
        }
        let old_parent = child.parent();
        if let Some(old) = &old_parent {
            if old.is_same(self) {
                return child.move_before(before);
            }
        }
        if let Some(name) = child.name() {
            if self.child(name).is_some() {
                return Err(PropError::DuplicateName(name.to_string()));
            }
        }
        // Resolve the slot first so a bad `before` leaves the child where it was.
        let index = {
            let st = self.node.state();
            match before {
                Some(b) => st
                    .children
                    .iter()
                    .position(|c| c.is_same(b))
                    .ok_or(PropError::NotAChild)?,
                None => st.children.len(),
            }
        };
        if let Some(old) = old_parent {
            old.detach(child)?;
        }
        {
            let mut st = self.node.state();
            st.children.insert(index, child.clone());
            st.directory = true;
        }
        child.node.state().parent = Arc::downgrade(&self.node);
        self.notify(&PropEvent::AddChild {
            child: child.clone(),
            before: before.cloned(),
        });
        Ok(())
    }

    fn is_ancestor_of(&self, other: &Prop) -> bool {
        let mut cursor = other.parent();
        while let Some(p) = cursor {
            if p.is_same(self) {
                return true;
            }
            cursor = p.parent();
        }
        false
    }

    /// Remove `child` from this node without destroying it.
    fn detach(&self, child: &Prop) -> Result<(), PropError> {
        self.remove_from_children(child)?;
        self.notify(&PropEvent::DelChild(child.clone()));
        Ok(())
    }

    fn remove_from_children(&self, child: &Prop) -> Result<(), PropError> {
        {
            let mut st = self.node.state();
            let index = st
                .children
                .iter()
                .position(|c| c.is_same(child))
                .ok_or(PropError::NotAChild)?;
            st.children.remove(index);
        }
        child.node.state().parent = Weak::new();
        Ok(())
    }

    /// Remove and destroy `child`.
    ///
    /// Subscribers with `early_child_delete` see `DelChild` before the
    /// child's subtree is torn down; all others see it afterwards.
    pub fn delete_child(&self, child: &Prop) -> Result<(), PropError> {
        let _tree = tree_lock();
        self.ensure_alive()?;
        self.remove_from_children(child)?;

        let subscribers = self.snapshot_subscribers();
        let event = PropEvent::DelChild(child.clone());
        for sub in subscribers.iter().filter(|s| s.options.early_child_delete) {
            sub.deliver(&event);
        }
        child.zombify();
        for sub in subscribers.iter().filter(|s| !s.options.early_child_delete) {
            sub.deliver(&event);
        }
        Ok(())
    }

    /// Delete the child called `name`. Returns false if there was none.
    pub fn delete_child_by_name(&self, name: &str) -> Result<bool, PropError> {
        let _tree = tree_lock();
        match self.child(name) {
            Some(child) => self.delete_child(&child).map(|()| true),
            None => {
                self.ensure_alive()?;
                Ok(false)
            }
        }
    }

    /// Move this node before its sibling `before`, or to the end when `None`.
    pub fn move_before(&self, before: Option<&Prop>) -> Result<(), PropError> {
        let _tree = tree_lock();
        self.ensure_alive()?;
        let parent = self.parent().ok_or(PropError::NotAChild)?;
        {
            let mut st = parent.node.state();
            let from = st
                .children
                .iter()
                .position(|c| c.is_same(self))
                .ok_or(PropError::NotAChild)?;
            let moved = st.children.remove(from);
            let to = match before {
                Some(b) if b.is_same(self) => from,
                Some(b) => match st.children.iter().position(|c| c.is_same(b)) {
                    Some(index) => index,
                    None => {
                        st.children.insert(from, moved);
                        return Err(PropError::NotAChild);
                    }
                },
                None => st.children.len(),
            };
            st.children.insert(to, moved);
            if to == from {
                return Ok(());
            }
        }
        parent.notify(&PropEvent::MoveChild {
            child: self.clone(),
            before: before.cloned(),
        });
        Ok(())
    }

    /// Deliver a notification without changing stored state.
    pub fn send_event(&self, notification: Notification) -> Result<(), PropError> {
        let _tree = tree_lock();
        self.ensure_alive()?;
        let event = match notification {
            Notification::Actions(actions) => PropEvent::Actions(actions),
            Notification::Custom { kind, payload } => PropEvent::Custom { kind, payload },
        };
        self.notify(&event);
        Ok(())
    }

    pub fn send_actions(&self, actions: &[&str]) -> Result<(), PropError> {
        self.send_event(Notification::Actions(
            actions.iter().map(|a| a.to_string()).collect(),
        ))
    }

    /// Destroy this node and its subtree. Calling it again is a no-op.
    pub fn destroy(&self) {
        let _tree = tree_lock();
        if self.is_zombie() {
            return;
        }
        match self.parent() {
            Some(parent) if !parent.is_zombie() => {
                if parent.delete_child(self).is_err() {
                    self.zombify();
                }
            }
            _ => self.zombify(),
        }
    }

    /// Mark the subtree zombie, children first, then deliver one
    /// `Destroyed` to each subscriber and drop it.
    fn zombify(&self) {
        let (children, subscribers) = {
            let mut st = self.node.state();
            if st.zombie {
                return;
            }
            st.zombie = true;
            (
                std::mem::take(&mut st.children),
                std::mem::take(&mut st.subscribers),
            )
        };
        tracing::trace!(
            name = self.name().unwrap_or("<anonymous>"),
            children = children.len(),
            subscribers = subscribers.len(),
            "property destroyed"
        );
        for child in &children {
            child.node.state().parent = Weak::new();
            child.zombify();
        }
        for sub in subscribers {
            sub.finish();
        }
    }

    /// Register `callback`. Unless `no_initial_update` is set, the current
    /// value and children are replayed before this returns.
    pub fn subscribe<F>(&self, options: SubscriptionOptions, callback: F) -> Result<Subscription, PropError>
    where
        F: Fn(&PropEvent) + Send + Sync + 'static,
    {
        self.subscribe_with(options, Arc::new(callback))
    }

    pub fn subscribe_with(
        &self,
        options: SubscriptionOptions,
        callback: PropCallback,
    ) -> Result<Subscription, PropError> {
        let _tree = tree_lock();
        let entry = Arc::new(SubscriberEntry::new(options, callback));
        let (value, children) = {
            let mut st = self.node.state();
            if st.zombie {
                return Err(PropError::Zombie);
            }
            st.subscribers.push(entry.clone());
            let value = if st.directory {
                PropValue::Directory
            } else {
                st.value.clone()
            };
            (value, st.children.clone())
        };
        if !options.no_initial_update {
            entry.deliver(&PropEvent::Set(value));
            for child in children {
                entry.deliver(&PropEvent::AddChild { child, before: None });
            }
        }
        Ok(Subscription::new(entry, Arc::downgrade(&self.node)))
    }

    /// Render the subtree as indented text.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.dump_into(&mut out, 0);
        out
    }

    fn dump_into(&self, out: &mut String, depth: usize) {
        let name = self.name().unwrap_or("<anonymous>");
        let _ = write!(out, "{:indent$}{name}", "", indent = depth * 2);
        let display = self.display_value();
        if self.is_directory() {
            if display.is_void() {
                out.push_str(" <dir>");
            } else {
                let _ = write!(out, " <dir> = {display}");
            }
        } else {
            let _ = write!(out, " = {display}");
        }
        if self.is_zombie() {
            out.push_str(" (zombie)");
        }
        out.push('\n');
        for child in self.children() {
            child.dump_into(out, depth + 1);
        }
    }
}
