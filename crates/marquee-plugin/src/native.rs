//! In-process engine backed by Rust closures.
//!
//! Modules are closures registered by name on a [`NativeEngine`]. The
//! source of a native entrypoint is just the module name. Closures can
//! register further closures as interpreter functions through
//! [`NativeScope::function`], which is how they hand route and
//! subscription handlers to the host.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::engine::{Interpreter, ScriptEngine, ScriptError, ScriptFn, ScriptValue};
use crate::error::PluginError;
use crate::host::HostApi;

/// A native function body.
pub type NativeFn =
    Arc<dyn Fn(&NativeScope, &[ScriptValue]) -> Result<ScriptValue, ScriptError> + Send + Sync>;

/// Engine whose modules are Rust closures.
#[derive(Clone, Default)]
pub struct NativeEngine {
    modules: Arc<RwLock<HashMap<String, NativeFn>>>,
}

impl std::fmt::Debug for NativeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let modules = self.modules.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<_> = modules.keys().collect();
        names.sort();
        f.debug_struct("NativeEngine")
            .field("modules", &names)
            .finish()
    }
}

impl NativeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the module called `name`. Its closure is the
    /// entrypoint body.
    pub fn register_module<F>(&self, name: &str, body: F)
    where
        F: Fn(&NativeScope, &[ScriptValue]) -> Result<ScriptValue, ScriptError>
            + Send
            + Sync
            + 'static,
    {
        self.modules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::new(body));
    }

    pub fn has_module(&self, name: &str) -> bool {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }
}

impl ScriptEngine for NativeEngine {
    fn name(&self) -> &str {
        "native"
    }

    fn create_heap(&self, host: HostApi) -> Result<Arc<dyn Interpreter>, PluginError> {
        Ok(Arc::new(NativeInterpreter {
            modules: self.modules.clone(),
            host,
            table: Arc::new(FunctionTable::default()),
            destroyed: AtomicBool::new(false),
        }))
    }
}

#[derive(Default)]
struct FunctionTable {
    next: AtomicU64,
    functions: Mutex<HashMap<u64, NativeFn>>,
}

impl FunctionTable {
    fn insert(&self, body: NativeFn) -> ScriptFn {
        let id = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        self.functions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, body);
        ScriptFn(id)
    }

    fn get(&self, func: ScriptFn) -> Option<NativeFn> {
        self.functions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&func.0)
            .cloned()
    }

    fn clear(&self) {
        self.functions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// What a native function sees of its interpreter.
pub struct NativeScope {
    host: HostApi,
    table: Arc<FunctionTable>,
}

impl NativeScope {
    /// Host bindings of the calling context.
    pub fn host(&self) -> &HostApi {
        &self.host
    }

    /// Make `body` callable from the host, e.g. as a route handler.
    pub fn function<F>(&self, body: F) -> ScriptFn
    where
        F: Fn(&NativeScope, &[ScriptValue]) -> Result<ScriptValue, ScriptError>
            + Send
            + Sync
            + 'static,
    {
        self.table.insert(Arc::new(body))
    }
}

struct NativeInterpreter {
    modules: Arc<RwLock<HashMap<String, NativeFn>>>,
    host: HostApi,
    table: Arc<FunctionTable>,
    destroyed: AtomicBool,
}

impl Interpreter for NativeInterpreter {
    fn compile(&self, _name: &str, source: &[u8]) -> Result<ScriptFn, ScriptError> {
        let module = std::str::from_utf8(source)
            .map_err(|e| ScriptError::Compile(format!("native entrypoint is not UTF-8: {e}")))?
            .trim();
        let body = self
            .modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(module)
            .cloned()
            .ok_or_else(|| ScriptError::Compile(format!("no native module named '{module}'")))?;
        Ok(self.table.insert(body))
    }

    fn call(&self, func: ScriptFn, args: &[ScriptValue]) -> Result<ScriptValue, ScriptError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(ScriptError::Throw("heap has been destroyed".into()));
        }
        let body = self
            .table
            .get(func)
            .ok_or_else(|| ScriptError::Throw(format!("unknown function #{}", func.0)))?;
        let scope = NativeScope {
            host: self.host.clone(),
            table: self.table.clone(),
        };
        body(&scope, args)
    }

    fn destroy_heap(&self) {
        self.destroyed.store(true, Ordering::Release);
        self.table.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::context_with;

    #[test]
    fn test_compile_unknown_module() {
        let ctx = context_with("n1", NativeEngine::new());
        let guard = ctx.begin();
        let err = guard.interpreter().unwrap().compile("main", b"missing").unwrap_err();
        assert_eq!(err, ScriptError::Compile("no native module named 'missing'".into()));
    }

    #[test]
    fn test_functions_receive_arguments() {
        let engine = NativeEngine::new();
        engine.register_module("sum", |scope, _args| {
            let add = scope.function(|_scope, args| {
                let total: i64 = args.iter().filter_map(ScriptValue::as_int).sum();
                Ok(ScriptValue::Int(total))
            });
            Ok(ScriptValue::Function(add))
        });
        assert!(engine.has_module("sum"));

        let ctx = context_with("n2", engine);
        let guard = ctx.begin();
        let interp = guard.interpreter().unwrap();
        let main = interp.compile("main", b" sum\n").unwrap();
        let add = interp.call(main, &[]).unwrap().as_function().unwrap();
        let result = interp
            .call(add, &[ScriptValue::Int(2), ScriptValue::Int(3)])
            .unwrap();
        assert_eq!(result.as_int(), Some(5));
    }

    #[test]
    fn test_calls_fail_after_destroy_heap() {
        let engine = NativeEngine::new();
        engine.register_module("m", |_s, _a| Ok(ScriptValue::Bool(true)));
        let ctx = context_with("n3", engine);
        let guard = ctx.begin();
        let interp = guard.interpreter().unwrap();
        let main = interp.compile("main", b"m").unwrap();
        interp.destroy_heap();
        assert!(matches!(interp.call(main, &[]), Err(ScriptError::Throw(_))));
    }

    #[test]
    fn test_scope_exposes_host() {
        let engine = NativeEngine::new();
        engine.register_module("who", |scope, _a| Ok(ScriptValue::from(scope.host().id())));
        let ctx = context_with("n4", engine);
        let guard = ctx.begin();
        let interp = guard.interpreter().unwrap();
        let main = interp.compile("main", b"who").unwrap();
        assert_eq!(interp.call(main, &[]).unwrap().as_str(), Some("n4"));
    }
}
