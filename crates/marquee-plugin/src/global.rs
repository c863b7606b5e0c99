//! Process-wide context manager.
//!
//! Hosts that embed a single runtime install it here once at startup so
//! code without a handle to it can still reach routes and services.

use std::sync::{Arc, PoisonError, RwLock};

use crate::error::PluginError;
use crate::manager::ContextManager;

static MANAGER: RwLock<Option<Arc<ContextManager>>> = RwLock::new(None);

/// Install `manager` as the process-wide runtime.
pub fn init(manager: ContextManager) -> Result<Arc<ContextManager>, PluginError> {
    let mut slot = MANAGER.write().unwrap_or_else(PoisonError::into_inner);
    if slot.is_some() {
        return Err(PluginError::AlreadyExists("global context manager".into()));
    }
    let manager = Arc::new(manager);
    *slot = Some(manager.clone());
    Ok(manager)
}

pub fn get() -> Option<Arc<ContextManager>> {
    MANAGER
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Unload every context and uninstall the process-wide runtime.
pub fn shutdown() {
    let manager = MANAGER
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    if let Some(manager) = manager {
        manager.shutdown();
    }
}
