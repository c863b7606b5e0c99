//! Runtime configuration from environment variables.

use std::path::PathBuf;

use crate::wasm::SandboxConfig;

/// Where plugins are found and where they may keep state.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Directory scanned for plugin directories (default: `./plugins`).
    pub plugin_dir: PathBuf,
    /// Parent of every plugin's storage path (default: `./data/plugins`).
    pub storage_dir: PathBuf,
    pub sandbox: SandboxConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::from("./plugins"),
            storage_dir: PathBuf::from("./data/plugins"),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from any key lookup.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            plugin_dir: var("MARQUEE_PLUGIN_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.plugin_dir),
            storage_dir: var("MARQUEE_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_dir),
            sandbox: SandboxConfig::from_lookup(&var),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_runtime_config_default() {
        let config = RuntimeConfig::default();
        assert_eq!(config.plugin_dir, PathBuf::from("./plugins"));
        assert_eq!(config.storage_dir, PathBuf::from("./data/plugins"));
    }

    #[test]
    fn test_runtime_config_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("MARQUEE_PLUGIN_DIR", "/srv/plugins"),
            ("MARQUEE_STORAGE_DIR", "/srv/state"),
            ("MARQUEE_WASM_FUEL_LIMIT", "500"),
        ]
        .into_iter()
        .collect();

        let config = RuntimeConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.plugin_dir, PathBuf::from("/srv/plugins"));
        assert_eq!(config.storage_dir, PathBuf::from("/srv/state"));
        assert_eq!(config.sandbox.fuel_limit, 500);

        let config = RuntimeConfig::from_lookup(|_| None);
        assert_eq!(config.plugin_dir, PathBuf::from("./plugins"));
    }
}
