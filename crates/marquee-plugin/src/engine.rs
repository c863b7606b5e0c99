//! Script engine boundary.
//!
//! The runtime never interprets extension code itself. A [`ScriptEngine`]
//! creates one [`Interpreter`] heap per execution context; the context only
//! ever calls into the heap while holding its own lock.

use std::sync::Arc;

use marquee_prop::{Prop, PropError, PropValue};
use thiserror::Error;

use crate::error::PluginError;
use crate::host::HostApi;

/// Errors raised by extension code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("compile error: {0}")]
    Compile(String),

    #[error("{0}")]
    Throw(String),
}

impl From<PluginError> for ScriptError {
    fn from(err: PluginError) -> Self {
        match err {
            PluginError::Compile(msg) => ScriptError::Compile(msg),
            PluginError::Throw(msg) => ScriptError::Throw(msg),
            other => ScriptError::Throw(other.to_string()),
        }
    }
}

impl From<PropError> for ScriptError {
    fn from(err: PropError) -> Self {
        ScriptError::Throw(err.to_string())
    }
}

/// Opaque handle to a compiled function living in an interpreter heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScriptFn(pub u64);

/// A value crossing the host/interpreter boundary.
#[derive(Debug, Clone, Default)]
pub enum ScriptValue {
    #[default]
    Undefined,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Prop(Prop),
    Function(ScriptFn),
    List(Vec<ScriptValue>),
}

impl ScriptValue {
    pub fn is_undefined(&self) -> bool {
        matches!(self, ScriptValue::Undefined)
    }

    pub fn as_prop(&self) -> Option<&Prop> {
        match self {
            ScriptValue::Prop(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScriptValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ScriptValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<ScriptFn> {
        match self {
            ScriptValue::Function(f) => Some(*f),
            _ => None,
        }
    }

    /// Convert to a property value. Props, functions and lists have no
    /// property representation and become `Void`.
    pub fn to_prop_value(&self) -> PropValue {
        match self {
            ScriptValue::Bool(b) => PropValue::from(*b),
            ScriptValue::Int(i) => PropValue::Int(*i),
            ScriptValue::Float(v) => PropValue::Float(*v),
            ScriptValue::String(s) => PropValue::String(s.clone()),
            _ => PropValue::Void,
        }
    }
}

impl From<PropValue> for ScriptValue {
    fn from(value: PropValue) -> Self {
        match value {
            PropValue::Void | PropValue::Directory => ScriptValue::Undefined,
            PropValue::String(s) => ScriptValue::String(s),
            PropValue::Int(i) => ScriptValue::Int(i),
            PropValue::Float(v) => ScriptValue::Float(v),
        }
    }
}

impl From<&str> for ScriptValue {
    fn from(s: &str) -> Self {
        ScriptValue::String(s.to_string())
    }
}

impl From<String> for ScriptValue {
    fn from(s: String) -> Self {
        ScriptValue::String(s)
    }
}

impl From<Prop> for ScriptValue {
    fn from(p: Prop) -> Self {
        ScriptValue::Prop(p)
    }
}

/// Factory for interpreter heaps.
pub trait ScriptEngine: Send + Sync {
    /// Engine name as used in plugin manifests.
    fn name(&self) -> &str;

    /// Allocate a fresh heap bound to one execution context.
    fn create_heap(&self, host: HostApi) -> Result<Arc<dyn Interpreter>, PluginError>;
}

/// One interpreter heap.
///
/// Callers serialize access through the owning context's lock, so
/// implementations only need enough interior locking to be `Sync`.
pub trait Interpreter: Send + Sync {
    /// Compile `source` and return its top-level function.
    fn compile(&self, name: &str, source: &[u8]) -> Result<ScriptFn, ScriptError>;

    fn call(&self, func: ScriptFn, args: &[ScriptValue]) -> Result<ScriptValue, ScriptError>;

    /// Release the heap. Later calls fail with a throw error.
    fn destroy_heap(&self);
}
