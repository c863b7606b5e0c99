//! Marquee plugin runtime
//!
//! Runs extensions in isolated execution contexts. Each context owns an
//! interpreter heap (a WASM module under Extism, or Rust closures for the
//! native engine) and every resource the extension creates: routes,
//! property subscriptions, timers and service entries. Unloading a context
//! tears all of them down.
//!
//! URLs are served by dispatching to the first route whose pattern matches,
//! which fills a page property tree.

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod global;
pub mod host;
pub mod manager;
pub mod manifest;
pub mod native;
pub mod resource;
pub mod route;
pub mod service;
pub mod subscription;
pub mod timer;
pub mod wasm;

pub use config::RuntimeConfig;
pub use context::{Context, ContextGuard, ContextState, Entrypoint};
pub use engine::{Interpreter, ScriptEngine, ScriptError, ScriptFn, ScriptValue};
pub use error::PluginError;
pub use host::HostApi;
pub use manager::{ContextInfo, ContextManager};
pub use manifest::{EngineKind, PluginManifest};
pub use native::{NativeEngine, NativeScope};
pub use resource::{Resource, ResourceClass, WeakResource};
pub use wasm::{SandboxConfig, WasmEngine};

pub use marquee_prop::{Prop, PropEvent, PropValue, SubscriptionOptions};
