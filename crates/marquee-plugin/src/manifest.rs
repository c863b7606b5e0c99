//! Plugin manifest parsing and validation.
//!
//! A plugin directory carries a `plugin.toml` naming the plugin and the
//! file and engine its entrypoint runs on.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::PluginError;

/// Plugin manifest parsed from `plugin.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub plugin: PluginMeta,
    pub entry: EntryConfig,
}

/// Plugin metadata section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginMeta {
    pub id: String,
    pub title: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
}

/// Entrypoint section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryConfig {
    pub file: String,
    #[serde(default)]
    pub engine: EngineKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Wasm,
    Native,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Wasm => "wasm",
            EngineKind::Native => "native",
        }
    }
}

// ─── Validation helpers ─────────────────────────────────────────────

/// Validate a plugin id against `^[a-z][a-z0-9-]{1,63}$`.
fn validate_plugin_id(id: &str) -> Result<(), PluginError> {
    let len = id.len();
    if !(2..=64).contains(&len) {
        return Err(PluginError::InvalidManifest(format!(
            "plugin id must be 2-64 characters, got {len}"
        )));
    }

    let mut chars = id.chars();
    if let Some(first) = chars.next() {
        if !first.is_ascii_lowercase() {
            return Err(PluginError::InvalidManifest(format!(
                "plugin id must start with a lowercase letter, got '{first}'"
            )));
        }
    }
    for ch in chars {
        if !ch.is_ascii_lowercase() && !ch.is_ascii_digit() && ch != '-' {
            return Err(PluginError::InvalidManifest(format!(
                "plugin id contains invalid character '{ch}'"
            )));
        }
    }
    Ok(())
}

fn validate_semver(value: &str, field_name: &str) -> Result<(), PluginError> {
    semver::Version::parse(value).map_err(|_| {
        PluginError::InvalidManifest(format!("{field_name} is not valid semver: '{value}'"))
    })?;
    Ok(())
}

/// Validate that a path is safe (no `..` components, not absolute).
fn validate_path_safety(path: &str, field_name: &str) -> Result<(), PluginError> {
    let p = Path::new(path);
    if path.is_empty() {
        return Err(PluginError::InvalidManifest(format!(
            "{field_name} must not be empty"
        )));
    }
    if p.is_absolute() {
        return Err(PluginError::InvalidManifest(format!(
            "{field_name} must be a relative path, got absolute: '{path}'"
        )));
    }
    if p.components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
    {
        return Err(PluginError::InvalidManifest(format!(
            "{field_name} must not contain '..': '{path}'"
        )));
    }
    Ok(())
}

impl PluginManifest {
    pub const FILE_NAME: &'static str = "plugin.toml";

    /// Parse a plugin manifest from a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, PluginError> {
        let manifest: PluginManifest = toml::from_str(toml_str)?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), PluginError> {
        validate_plugin_id(&self.plugin.id)?;
        validate_semver(&self.plugin.version, "plugin.version")?;

        let title_len = self.plugin.title.chars().count();
        if title_len == 0 || title_len > 255 {
            return Err(PluginError::InvalidManifest(format!(
                "plugin.title must be 1-255 characters, got {title_len}"
            )));
        }
        if let Some(ref description) = self.plugin.description {
            if description.len() > 500 {
                return Err(PluginError::InvalidManifest(format!(
                    "plugin.description must be at most 500 characters, got {}",
                    description.len()
                )));
            }
        }

        validate_path_safety(&self.entry.file, "entry.file")?;
        if self.entry.engine == EngineKind::Wasm && !self.entry.file.ends_with(".wasm") {
            return Err(PluginError::InvalidManifest(format!(
                "entry.file must end with '.wasm' for the wasm engine, got '{}'",
                self.entry.file
            )));
        }
        Ok(())
    }

    pub fn parse_and_validate(toml_str: &str) -> Result<Self, PluginError> {
        let manifest = Self::parse(toml_str)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Read and validate `dir/plugin.toml`.
    pub fn load(dir: &Path) -> Result<Self, PluginError> {
        let text = std::fs::read_to_string(dir.join(Self::FILE_NAME))?;
        Self::parse_and_validate(&text)
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
