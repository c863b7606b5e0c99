//! Context manager: the registry of live contexts.
//!
//! The manager owns load/unload sequencing. It keeps one reference to each
//! registered context, in load order, and dropping that reference is the
//! last step of [`ContextManager::unload`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use marquee_prop::Prop;
use serde::Serialize;

use crate::config::RuntimeConfig;
use crate::context::{Context, ContextState, Entrypoint};
use crate::engine::ScriptEngine;
use crate::error::PluginError;
use crate::manifest::PluginManifest;
use crate::route::{self, RouteTable};

/// State shared by every context of one manager.
pub(crate) struct Shared {
    pub(crate) routes: RouteTable,
    pub(crate) services: Prop,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            routes: RouteTable::default(),
            services: Prop::create_root(Some("services")),
        }
    }
}

/// Diagnostics snapshot of one context.
#[derive(Debug, Clone, Serialize)]
pub struct ContextInfo {
    pub id: String,
    pub state: ContextState,
    pub engine: String,
    pub error: Option<String>,
    pub resources: usize,
    pub storage_path: PathBuf,
    pub loaded_at: Option<DateTime<Utc>>,
}

/// Registry of live execution contexts.
pub struct ContextManager {
    config: RuntimeConfig,
    shared: Arc<Shared>,
    contexts: RwLock<Vec<Context>>,
    engines: RwLock<HashMap<String, Arc<dyn ScriptEngine>>>,
}

impl std::fmt::Debug for ContextManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextManager")
            .field("config", &self.config)
            .field("contexts", &self.len())
            .finish_non_exhaustive()
    }
}

impl ContextManager {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::new()),
            contexts: RwLock::new(Vec::new()),
            engines: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Make `engine` available to manifests under its name.
    pub fn register_engine(&self, engine: Arc<dyn ScriptEngine>) {
        let name = engine.name().to_string();
        tracing::debug!(engine = %name, "script engine registered");
        self.engines
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, engine);
    }

    pub fn engine(&self, name: &str) -> Option<Arc<dyn ScriptEngine>> {
        self.engines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// The global service directory.
    pub fn services(&self) -> Prop {
        self.shared.services.clone()
    }

    pub fn get(&self, id: &str) -> Option<Context> {
        self.contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|c| c.id() == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register a new context in state `Created`.
    pub fn create(
        &self,
        id: &str,
        storage_path: &Path,
        engine: Arc<dyn ScriptEngine>,
    ) -> Result<Context, PluginError> {
        let mut contexts = self.contexts.write().unwrap_or_else(PoisonError::into_inner);
        if contexts.iter().any(|c| c.id() == id) {
            return Err(PluginError::AlreadyExists(id.to_string()));
        }
        let ctx = Context::create(id, storage_path, engine, self.shared.clone())?;
        contexts.push(ctx.clone());
        Ok(ctx)
    }

    /// Run the entrypoint of the registered context `id`.
    pub fn load(&self, id: &str, entrypoint: Entrypoint) -> Result<(), PluginError> {
        self.get(id)
            .ok_or_else(|| PluginError::NotFound(id.to_string()))?
            .load(entrypoint)
    }

    /// Create and load in one step. A failing entrypoint leaves the context
    /// registered in state `Failed`.
    pub fn load_plugin(
        &self,
        id: &str,
        storage_path: &Path,
        entrypoint: Entrypoint,
        engine: Arc<dyn ScriptEngine>,
    ) -> Result<Context, PluginError> {
        let ctx = self.create(id, storage_path, engine)?;
        ctx.load(entrypoint)?;
        Ok(ctx)
    }

    /// Load the plugin whose `plugin.toml` is in `dir`.
    pub fn load_plugin_dir(&self, dir: &Path) -> Result<Context, PluginError> {
        let manifest = PluginManifest::load(dir)?;
        let engine_name = manifest.entry.engine.as_str();
        let engine = self
            .engine(engine_name)
            .ok_or_else(|| PluginError::NotFound(format!("script engine '{engine_name}'")))?;
        let source = std::fs::read(dir.join(&manifest.entry.file))?;
        let storage = self.config.storage_dir.join(&manifest.plugin.id);

        tracing::info!(
            plugin = %manifest.plugin.id,
            version = %manifest.plugin.version,
            engine = %engine_name,
            "loading plugin"
        );
        self.load_plugin(
            &manifest.plugin.id,
            &storage,
            Entrypoint::new(manifest.entry.file.clone(), source),
            engine,
        )
    }

    /// Load every plugin directory under the configured plugin dir.
    ///
    /// Failures are logged and skipped. Returns how many plugins are
    /// running afterwards.
    pub fn load_all(&self) -> Result<usize, PluginError> {
        let mut dirs: Vec<PathBuf> = std::fs::read_dir(&self.config.plugin_dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.join(PluginManifest::FILE_NAME).is_file())
            .collect();
        dirs.sort();

        let mut running = 0;
        for dir in dirs {
            match self.load_plugin_dir(&dir) {
                Ok(_) => running += 1,
                Err(e) => tracing::error!(path = %dir.display(), "failed to load plugin: {e}"),
            }
        }
        Ok(running)
    }

    /// Unload `id` and drop the registry's reference to it.
    pub fn unload(&self, id: &str) -> Result<(), PluginError> {
        let ctx = self
            .get(id)
            .ok_or_else(|| PluginError::NotFound(id.to_string()))?;
        ctx.unload()?;
        self.contexts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|c| !c.is_same(&ctx));
        ctx.release()
    }

    /// Unload `id` and load it again from the same entrypoint.
    pub fn reload(&self, id: &str) -> Result<Context, PluginError> {
        let ctx = self
            .get(id)
            .ok_or_else(|| PluginError::NotFound(id.to_string()))?;
        let entrypoint = ctx.entrypoint().ok_or_else(|| {
            PluginError::InvalidState(format!("context '{id}' was never loaded"))
        })?;
        let storage = ctx.storage_path().to_path_buf();
        let engine = ctx.engine();
        self.unload(id)?;
        tracing::info!(plugin = %id, "reloading plugin");
        self.load_plugin(id, &storage, entrypoint, engine)
    }

    /// Route `url` to the first matching handler and return its page.
    pub fn dispatch(&self, url: &str) -> Result<Prop, PluginError> {
        route::dispatch(&self.shared.routes, url)
    }

    /// Like [`dispatch`](Self::dispatch), rendering failures as an error page.
    pub fn open(&self, url: &str) -> Prop {
        route::open(&self.shared.routes, url)
    }

    /// Registered route patterns in match order, with the owning context id.
    pub fn routes(&self) -> Vec<(String, String)> {
        self.shared.routes.patterns()
    }

    pub fn contexts(&self) -> Vec<ContextInfo> {
        self.contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|c| ContextInfo {
                id: c.id().to_string(),
                state: c.state(),
                engine: c.engine().name().to_string(),
                error: c.error(),
                resources: c.resource_count(),
                storage_path: c.storage_path().to_path_buf(),
                loaded_at: c.loaded_at(),
            })
            .collect()
    }

    /// Unload every context, most recently loaded first.
    pub fn shutdown(&self) {
        let ids: Vec<String> = self
            .contexts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .map(|c| c.id().to_string())
            .collect();
        for id in ids {
            if let Err(e) = self.unload(&id) {
                tracing::error!(plugin = %id, "failed to unload plugin: {e}");
            }
        }
        tracing::info!("plugin runtime shut down");
    }
}
