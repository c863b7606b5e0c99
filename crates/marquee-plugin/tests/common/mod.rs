// Shared test utilities for integration tests
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use marquee_plugin::{
    Context, ContextManager, Entrypoint, NativeEngine, NativeScope, Prop, RuntimeConfig,
    ScriptError, ScriptValue,
};

/// A manager with default config and no engines registered.
pub fn test_manager() -> ContextManager {
    ContextManager::new(RuntimeConfig::default())
}

/// Load module `id` of `engine` as context `id`.
pub fn load_native(manager: &ContextManager, id: &str, engine: &NativeEngine) -> Context {
    manager
        .load_plugin(
            id,
            &Path::new("/tmp/marquee-it").join(id),
            Entrypoint::new("main", id),
            Arc::new(engine.clone()),
        )
        .unwrap()
}

/// The page argument every route handler receives first.
pub fn page_arg(args: &[ScriptValue]) -> Result<Prop, ScriptError> {
    args.first()
        .and_then(ScriptValue::as_prop)
        .cloned()
        .ok_or_else(|| ScriptError::Throw("route handler called without a page".into()))
}

/// Register a module that serves `pattern` by setting the page title to `title`.
pub fn titled_route(engine: &NativeEngine, module: &str, pattern: &'static str, title: &'static str) {
    engine.register_module(module, move |scope: &NativeScope, _| {
        let handler = scope.function(move |_, args| {
            page_arg(args)?.set_path(&["title"], title)?;
            Ok(ScriptValue::Undefined)
        });
        scope.host().register_route(pattern, handler)?;
        Ok(ScriptValue::Undefined)
    });
}

pub fn title_of(page: &Prop) -> Option<String> {
    page.child("title")
        .and_then(|t| t.value().as_str().map(str::to_string))
}
