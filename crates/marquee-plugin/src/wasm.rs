//! WASM script engine using Extism (wasmtime).
//!
//! Each context gets its own Extism plugin with a memory limit and a
//! fuel-based execution limit. The entrypoint module must export `init`.
//!
//! Calls pass `{"function": ..., "args": [...]}` as JSON. Props cross the
//! boundary as `{"prop": <handle>}` and functions as export names. A call
//! answers with `{"result": ..., "host_requests": [...]}`; host requests
//! are processed after the call returns, outside the plugin's lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use marquee_prop::{Prop, PropValue, SubscriptionOptions, WeakProp};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::engine::{Interpreter, ScriptEngine, ScriptError, ScriptFn, ScriptValue};
use crate::error::PluginError;
use crate::host::HostApi;

/// Export called to start a plugin.
pub const ENTRYPOINT_EXPORT: &str = "init";

// ─── Configuration ──────────────────────────────────────────────────────

/// Configuration for the WASM sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum memory in bytes (default: 32 MB).
    pub memory_limit: usize,
    /// Maximum fuel (instructions) per call (default: 1_000_000).
    pub fuel_limit: u64,
    /// Whether to enable WASI (default: false).
    pub wasi_enabled: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit: 32 * 1024 * 1024,
            fuel_limit: 1_000_000,
            wasi_enabled: false,
        }
    }
}

impl SandboxConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from any key lookup, e.g. a parsed `.env` map.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            memory_limit: var("MARQUEE_WASM_MEMORY_LIMIT_MB")
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(32)
                * 1024
                * 1024,
            fuel_limit: var("MARQUEE_WASM_FUEL_LIMIT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1_000_000),
            wasi_enabled: var("MARQUEE_WASI_ENABLED")
                .unwrap_or_default()
                .eq_ignore_ascii_case("true"),
        }
    }
}

// ─── Wire format ────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct CallInput<'a> {
    function: &'a str,
    args: Vec<Value>,
}

/// A host function request returned by a plugin call.
#[derive(Debug, Deserialize)]
struct HostRequest {
    function: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Default, Deserialize)]
struct PluginResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    host_requests: Vec<HostRequest>,
}

#[derive(Debug, Default, Deserialize)]
struct SubscribeFlags {
    #[serde(default)]
    auto_destroy: bool,
    #[serde(default)]
    no_initial_update: bool,
    #[serde(default)]
    ignore_void: bool,
    #[serde(default)]
    early_child_delete: bool,
    #[serde(default)]
    action_as_array: bool,
}

impl From<SubscribeFlags> for SubscriptionOptions {
    fn from(f: SubscribeFlags) -> Self {
        SubscriptionOptions {
            auto_destroy: f.auto_destroy,
            no_initial_update: f.no_initial_update,
            ignore_void: f.ignore_void,
            early_child_delete: f.early_child_delete,
            action_as_array: f.action_as_array,
        }
    }
}

fn json_to_prop_value(value: &Value) -> PropValue {
    match value {
        Value::Null => PropValue::Void,
        Value::Bool(b) => PropValue::from(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => PropValue::Int(i),
            None => PropValue::Float(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => PropValue::String(s.clone()),
        other => PropValue::String(other.to_string()),
    }
}

fn string_path(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

// ─── Engine ─────────────────────────────────────────────────────────────

/// Engine running WASM modules in an Extism sandbox.
#[derive(Debug, Clone, Default)]
pub struct WasmEngine {
    config: SandboxConfig,
}

impl WasmEngine {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }
}

impl ScriptEngine for WasmEngine {
    fn name(&self) -> &str {
        "wasm"
    }

    fn create_heap(&self, host: HostApi) -> Result<Arc<dyn Interpreter>, PluginError> {
        Ok(Arc::new(WasmInterpreter::new(host, self.config.clone())))
    }
}

/// Handles for props the plugin has been shown. Entries are weak: a prop
/// the host drops (e.g. a finished page) does not outlive it here.
#[derive(Default)]
struct PropHandles {
    next: u64,
    by_handle: HashMap<u64, WeakProp>,
    by_node: HashMap<usize, u64>,
    prune_at: usize,
}

impl PropHandles {
    fn handle_for(&mut self, prop: &Prop) -> u64 {
        if let Some(handle) = self.by_node.get(&prop.node_key()) {
            return *handle;
        }
        if self.by_handle.len() >= self.prune_at {
            self.prune();
            self.prune_at = (self.by_handle.len() * 2).max(64);
        }
        self.next += 1;
        self.by_handle.insert(self.next, prop.downgrade());
        self.by_node.insert(prop.node_key(), self.next);
        self.next
    }

    fn get(&self, handle: u64) -> Option<Prop> {
        self.by_handle.get(&handle).and_then(WeakProp::upgrade)
    }

    fn prune(&mut self) {
        let by_node = &mut self.by_node;
        self.by_handle.retain(|_, weak| {
            let alive = weak.upgrade().is_some();
            if !alive {
                by_node.remove(&weak.node_key());
            }
            alive
        });
    }

    fn len(&self) -> usize {
        self.by_handle.len()
    }

    fn clear(&mut self) {
        self.by_handle.clear();
        self.by_node.clear();
    }
}

struct WasmInterpreter {
    host: HostApi,
    config: SandboxConfig,
    plugin: Mutex<Option<extism::Plugin>>,
    next_fn: AtomicU64,
    exports: Mutex<HashMap<u64, String>>,
    props: Mutex<PropHandles>,
}

impl WasmInterpreter {
    fn new(host: HostApi, config: SandboxConfig) -> Self {
        Self {
            host,
            config,
            plugin: Mutex::new(None),
            next_fn: AtomicU64::new(0),
            exports: Mutex::new(HashMap::new()),
            props: Mutex::new(PropHandles::default()),
        }
    }

    fn plugin(&self) -> MutexGuard<'_, Option<extism::Plugin>> {
        self.plugin.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn props(&self) -> MutexGuard<'_, PropHandles> {
        self.props.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The function handle for export `name`, allocating one on first use.
    fn export_fn(&self, name: &str) -> ScriptFn {
        let mut exports = self.exports.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some((id, _)) = exports.iter().find(|(_, export)| export.as_str() == name) {
            return ScriptFn(*id);
        }
        let id = self.next_fn.fetch_add(1, Ordering::Relaxed) + 1;
        exports.insert(id, name.to_string());
        ScriptFn(id)
    }

    fn export_name(&self, func: ScriptFn) -> Option<String> {
        self.exports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&func.0)
            .cloned()
    }

    fn classify_call_error(&self, msg: String) -> PluginError {
        if msg.contains("fuel") {
            PluginError::FuelExhausted(self.host.id().to_string())
        } else if msg.contains("memory") {
            PluginError::MemoryExceeded(self.host.id().to_string())
        } else {
            PluginError::Sandbox(msg)
        }
    }

    fn to_json(&self, value: &ScriptValue) -> Value {
        match value {
            ScriptValue::Undefined => Value::Null,
            ScriptValue::Bool(b) => Value::Bool(*b),
            ScriptValue::Int(i) => json!(i),
            ScriptValue::Float(v) => serde_json::Number::from_f64(*v)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            ScriptValue::String(s) => Value::String(s.clone()),
            ScriptValue::Prop(p) => json!({ "prop": self.props().handle_for(p) }),
            ScriptValue::Function(f) => match self.export_name(*f) {
                Some(name) => json!({ "function": name }),
                None => Value::Null,
            },
            ScriptValue::List(items) => Value::Array(items.iter().map(|v| self.to_json(v)).collect()),
        }
    }

    fn from_json(&self, value: &Value) -> ScriptValue {
        match value {
            Value::Null => ScriptValue::Undefined,
            Value::Bool(b) => ScriptValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => ScriptValue::Int(i),
                None => ScriptValue::Float(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => ScriptValue::String(s.clone()),
            Value::Array(items) => ScriptValue::List(items.iter().map(|v| self.from_json(v)).collect()),
            Value::Object(map) => {
                if let Some(prop) = map.get("prop").and_then(Value::as_u64) {
                    return self
                        .props()
                        .get(prop)
                        .map(ScriptValue::Prop)
                        .unwrap_or_default();
                }
                if let Some(name) = map.get("function").and_then(Value::as_str) {
                    return ScriptValue::Function(self.export_fn(name));
                }
                ScriptValue::Undefined
            }
        }
    }

    fn prop_arg(&self, args: &Value) -> Result<Prop, PluginError> {
        let handle = args["prop"].as_u64().unwrap_or_default();
        self.props()
            .get(handle)
            .ok_or_else(|| PluginError::Sandbox(format!("unknown prop handle {handle}")))
    }

    fn handler_arg(&self, args: &Value) -> Result<ScriptFn, PluginError> {
        let name = args["handler"].as_str().unwrap_or_default();
        let exported = self
            .plugin()
            .as_ref()
            .is_some_and(|plugin| plugin.function_exists(name));
        if !exported {
            return Err(PluginError::Sandbox(format!(
                "plugin does not export handler '{name}'"
            )));
        }
        Ok(self.export_fn(name))
    }

    /// Process host function requests from a plugin's response.
    fn process_host_requests(&self, requests: Vec<HostRequest>) {
        for req in requests {
            let result: Result<(), PluginError> = match req.function.as_str() {
                "register_route" => {
                    let pattern = req.args["pattern"].as_str().unwrap_or_default();
                    self.handler_arg(&req.args)
                        .and_then(|handler| self.host.register_route(pattern, handler))
                        .map(|_| ())
                }
                "subscribe" => {
                    let flags: SubscribeFlags =
                        serde_json::from_value(req.args["options"].clone()).unwrap_or_default();
                    self.prop_arg(&req.args).and_then(|prop| {
                        let handler = self.handler_arg(&req.args)?;
                        self.host.subscribe(&prop, handler, flags.into()).map(|_| ())
                    })
                }
                "set_timeout" => {
                    let delay = Duration::from_millis(req.args["delay_ms"].as_u64().unwrap_or_default());
                    let repeat = req.args["repeat"].as_bool().unwrap_or_default();
                    self.handler_arg(&req.args)
                        .and_then(|handler| self.host.set_timeout(delay, handler, repeat))
                        .map(|_| ())
                }
                "add_service" => {
                    let title = req.args["title"].as_str().unwrap_or_default();
                    let url = req.args["url"].as_str().unwrap_or_default();
                    let icon = req.args["icon"].as_str();
                    self.host.add_service(title, url, icon).map(|_| ())
                }
                "set" => self.prop_arg(&req.args).and_then(|prop| {
                    let path = string_path(&req.args["path"]);
                    let value = json_to_prop_value(&req.args["value"]);
                    if path.is_empty() {
                        prop.set_value(value)?;
                    } else {
                        let path: Vec<&str> = path.iter().map(String::as_str).collect();
                        prop.set_path(&path, value)?;
                    }
                    Ok(())
                }),
                "delete" => self.prop_arg(&req.args).and_then(|prop| {
                    let path = string_path(&req.args["path"]);
                    let Some((last, parents)) = path.split_last() else {
                        prop.destroy();
                        return Ok(());
                    };
                    let parent = parents
                        .iter()
                        .try_fold(prop, |node, name| node.child(name));
                    if let Some(parent) = parent {
                        parent.delete_child_by_name(last)?;
                    }
                    Ok(())
                }),
                "log_info" => {
                    self.host.log_info(req.args["message"].as_str().unwrap_or_default());
                    Ok(())
                }
                "log_warn" => {
                    self.host.log_warn(req.args["message"].as_str().unwrap_or_default());
                    Ok(())
                }
                "log_error" => {
                    self.host.log_error(req.args["message"].as_str().unwrap_or_default());
                    Ok(())
                }
                other => {
                    tracing::warn!(
                        plugin = %self.host.id(),
                        function = %other,
                        "unknown host function request, ignoring"
                    );
                    continue;
                }
            };

            if let Err(e) = result {
                tracing::error!(
                    plugin = %self.host.id(),
                    function = %req.function,
                    "host function request failed: {e}"
                );
            }
        }
    }
}

impl Interpreter for WasmInterpreter {
    fn compile(&self, name: &str, source: &[u8]) -> Result<ScriptFn, ScriptError> {
        let manifest = extism::Manifest::new([extism::Wasm::data(source.to_vec())])
            .with_memory_max((self.config.memory_limit / 65536) as u32);

        let builder = extism::PluginBuilder::new(manifest)
            .with_wasi(self.config.wasi_enabled)
            .with_fuel_limit(self.config.fuel_limit);

        if self.config.wasi_enabled {
            tracing::warn!(
                plugin = %self.host.id(),
                "WASI enabled for plugin, it can read environment variables"
            );
        }

        let plugin = builder
            .build()
            .map_err(|e| ScriptError::Compile(format!("{name}: {e}")))?;
        if !plugin.function_exists(ENTRYPOINT_EXPORT) {
            return Err(ScriptError::Compile(format!(
                "{name} does not export '{ENTRYPOINT_EXPORT}'"
            )));
        }
        *self.plugin() = Some(plugin);
        Ok(self.export_fn(ENTRYPOINT_EXPORT))
    }

    fn call(&self, func: ScriptFn, args: &[ScriptValue]) -> Result<ScriptValue, ScriptError> {
        let export = self
            .export_name(func)
            .ok_or_else(|| ScriptError::Throw(format!("unknown function #{}", func.0)))?;
        let input = CallInput {
            function: &export,
            args: args.iter().map(|a| self.to_json(a)).collect(),
        };
        let input = serde_json::to_vec(&input).map_err(|e| ScriptError::Throw(e.to_string()))?;

        let output = {
            let mut guard = self.plugin();
            let plugin = guard
                .as_mut()
                .ok_or_else(|| ScriptError::Throw("heap has been destroyed".into()))?;
            plugin
                .call::<&[u8], Vec<u8>>(&export, &input)
                .map_err(|e| ScriptError::from(self.classify_call_error(e.to_string())))?
        };

        let response: PluginResponse = if output.is_empty() {
            PluginResponse::default()
        } else {
            serde_json::from_slice(&output)
                .map_err(|e| ScriptError::Throw(format!("malformed response from '{export}': {e}")))?
        };
        if !response.host_requests.is_empty() {
            tracing::debug!(
                plugin = %self.host.id(),
                count = response.host_requests.len(),
                "processing host function requests"
            );
            self.process_host_requests(response.host_requests);
        }
        Ok(self.from_json(&response.result))
    }

    fn destroy_heap(&self) {
        self.plugin().take();
        self.props().clear();
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Context, ContextState, Entrypoint};
    use crate::manager::Shared;
    use std::path::Path;

    fn wasm_context(id: &str) -> Context {
        Context::create(
            id,
            Path::new("/tmp/marquee-wasm"),
            Arc::new(WasmEngine::default()),
            Arc::new(Shared::new()),
        )
        .unwrap()
    }

    fn interpreter(ctx: &Context) -> WasmInterpreter {
        WasmInterpreter::new(HostApi::new(ctx), SandboxConfig::default())
    }

    fn requests(value: Value) -> Vec<HostRequest> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_sandbox_config_default() {
        let config = SandboxConfig::default();
        assert_eq!(config.memory_limit, 32 * 1024 * 1024);
        assert_eq!(config.fuel_limit, 1_000_000);
        assert!(!config.wasi_enabled);
    }

    #[test]
    fn test_sandbox_config_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("MARQUEE_WASM_MEMORY_LIMIT_MB", "64"),
            ("MARQUEE_WASM_FUEL_LIMIT", "2000000"),
            ("MARQUEE_WASI_ENABLED", "TRUE"),
        ]
        .into_iter()
        .collect();

        let config = SandboxConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.memory_limit, 64 * 1024 * 1024);
        assert_eq!(config.fuel_limit, 2_000_000);
        assert!(config.wasi_enabled);

        let config_default = SandboxConfig::from_lookup(|_| None);
        assert_eq!(config_default.memory_limit, 32 * 1024 * 1024);
        assert!(!config_default.wasi_enabled);

        let garbage = SandboxConfig::from_lookup(|_| Some("lots".into()));
        assert_eq!(garbage.fuel_limit, 1_000_000);
    }

    #[test]
    fn test_load_invalid_wasm_fails_context() {
        let ctx = wasm_context("bad-wasm");
        let err = ctx
            .load(Entrypoint::new("bad.wasm", b"this is not valid wasm at all".to_vec()))
            .unwrap_err();
        assert!(matches!(err, PluginError::Compile(_)), "got {err:?}");
        assert_eq!(ctx.state(), ContextState::Failed);
    }

    #[test]
    fn test_classify_call_error() {
        let ctx = wasm_context("classify");
        let interp = interpreter(&ctx);
        assert!(matches!(
            interp.classify_call_error("out of fuel".into()),
            PluginError::FuelExhausted(ref id) if id == "classify"
        ));
        assert!(matches!(
            interp.classify_call_error("memory limit reached".into()),
            PluginError::MemoryExceeded(_)
        ));
        assert!(matches!(
            interp.classify_call_error("trap".into()),
            PluginError::Sandbox(_)
        ));
    }

    #[test]
    fn test_call_without_module_throws() {
        let ctx = wasm_context("no-module");
        let interp = interpreter(&ctx);
        let f = interp.export_fn("init");
        assert!(matches!(interp.call(f, &[]), Err(ScriptError::Throw(_))));
        assert!(matches!(interp.call(ScriptFn(99), &[]), Err(ScriptError::Throw(_))));
    }

    #[test]
    fn test_prop_handles_round_trip() {
        let ctx = wasm_context("handles");
        let interp = interpreter(&ctx);
        let page = Prop::create_root(Some("page"));
        let encoded = interp.to_json(&ScriptValue::Prop(page.clone()));
        assert_eq!(interp.to_json(&ScriptValue::Prop(page.clone())), encoded);
        let decoded = interp.from_json(&encoded);
        assert!(decoded.as_prop().unwrap().is_same(&page));
        assert!(interp.from_json(&json!({ "prop": 4242 })).is_undefined());
    }

    #[test]
    fn test_prop_handles_do_not_keep_props_alive() {
        let ctx = wasm_context("weak-handles");
        let interp = interpreter(&ctx);
        let page = Prop::create_root(Some("page"));
        let encoded = interp.to_json(&ScriptValue::Prop(page.clone()));
        drop(page);
        assert!(interp.from_json(&encoded).is_undefined());

        for _ in 0..1000 {
            let page = Prop::create_root(Some("page"));
            interp.to_json(&ScriptValue::Prop(page));
        }
        assert!(interp.props().len() <= 64, "{} handles kept", interp.props().len());
    }

    #[test]
    fn test_set_and_delete_requests() {
        let ctx = wasm_context("setter");
        let interp = interpreter(&ctx);
        let page = Prop::create_root(Some("page"));
        let handle = interp.props().handle_for(&page);

        interp.process_host_requests(requests(json!([
            { "function": "set", "args": { "prop": handle, "path": ["model", "title"], "value": "Hi" } },
            { "function": "set", "args": { "prop": handle, "path": ["count"], "value": 3 } },
            { "function": "set", "args": { "prop": handle, "path": ["ratio"], "value": 0.5 } },
        ])));
        let model = page.child("model").unwrap();
        assert_eq!(model.child("title").unwrap().value().as_str(), Some("Hi"));
        assert_eq!(page.child("count").unwrap().value().as_int(), Some(3));
        assert_eq!(page.child("ratio").unwrap().value(), PropValue::Float(0.5));

        interp.process_host_requests(requests(json!([
            { "function": "delete", "args": { "prop": handle, "path": ["model", "title"] } },
        ])));
        assert_eq!(model.child_count(), 0);
    }

    #[test]
    fn test_failed_and_unknown_requests_do_not_stop_the_rest() {
        let ctx = wasm_context("resilient");
        let interp = interpreter(&ctx);
        let page = Prop::create_root(Some("page"));
        let handle = interp.props().handle_for(&page);

        interp.process_host_requests(requests(json!([
            { "function": "teleport", "args": {} },
            { "function": "register_route", "args": { "pattern": "x:.*", "handler": "missing" } },
            { "function": "set", "args": { "prop": 9999, "value": 1 } },
            { "function": "log_info", "args": { "message": "still going" } },
            { "function": "set", "args": { "prop": handle, "value": "done" } },
        ])));
        assert_eq!(page.value().as_str(), Some("done"));
        assert_eq!(ctx.resource_count(), 0);
    }

    #[test]
    fn test_add_service_request() {
        let ctx = wasm_context("svc-wasm");
        let interp = interpreter(&ctx);
        interp.process_host_requests(requests(json!([
            { "function": "add_service", "args": { "title": "Tube", "url": "tube:start" } },
        ])));
        assert_eq!(ctx.resource_count(), 1);
        assert_eq!(ctx.shared().services.child_count(), 1);
    }

    #[test]
    fn test_subscribe_flags_default() {
        let options: SubscriptionOptions = serde_json::from_value::<SubscribeFlags>(json!({
            "no_initial_update": true
        }))
        .unwrap()
        .into();
        assert!(options.no_initial_update);
        assert!(!options.auto_destroy);
    }
}
