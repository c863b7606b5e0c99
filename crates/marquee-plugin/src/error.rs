//! Plugin runtime error types.

use marquee_prop::PropError;
use thiserror::Error;

use crate::engine::ScriptError;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("compile error: {0}")]
    Compile(String),

    #[error("script error: {0}")]
    Throw(String),

    #[error("no route matches '{0}'")]
    NoMatch(String),

    #[error("{class} resource #{id} released more times than it was retained")]
    DoubleDestroy { class: &'static str, id: u64 },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("sandbox error: {0}")]
    Sandbox(String),

    #[error("plugin not found: {0}")]
    NotFound(String),

    #[error("plugin already exists: {0}")]
    AlreadyExists(String),

    #[error("execution timeout: plugin {0} exceeded fuel limit")]
    FuelExhausted(String),

    #[error("memory limit exceeded: plugin {0}")]
    MemoryExceeded(String),

    #[error("property error: {0}")]
    Prop(#[from] PropError),

    #[error("invalid route pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("semver error: {0}")]
    Semver(#[from] semver::Error),
}

impl From<ScriptError> for PluginError {
    fn from(err: ScriptError) -> Self {
        match err {
            ScriptError::Compile(msg) => PluginError::Compile(msg),
            ScriptError::Throw(msg) => PluginError::Throw(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    // ── Display messages ──────────────────────────────────────────────

    #[test]
    fn test_display_compile() {
        let err = PluginError::Compile("unexpected token".into());
        assert_eq!(err.to_string(), "compile error: unexpected token");
    }

    #[test]
    fn test_display_throw() {
        let err = PluginError::Throw("boom".into());
        assert_eq!(err.to_string(), "script error: boom");
    }

    #[test]
    fn test_display_no_match() {
        let err = PluginError::NoMatch("app:missing".into());
        assert_eq!(err.to_string(), "no route matches 'app:missing'");
    }

    #[test]
    fn test_display_double_destroy() {
        let err = PluginError::DoubleDestroy {
            class: "route",
            id: 7,
        };
        assert_eq!(
            err.to_string(),
            "route resource #7 released more times than it was retained"
        );
    }

    #[test]
    fn test_display_fuel_exhausted() {
        let err = PluginError::FuelExhausted("my-plugin".into());
        assert_eq!(
            err.to_string(),
            "execution timeout: plugin my-plugin exceeded fuel limit"
        );
    }

    #[test]
    fn test_display_memory_exceeded() {
        let err = PluginError::MemoryExceeded("my-plugin".into());
        assert_eq!(err.to_string(), "memory limit exceeded: plugin my-plugin");
    }

    #[test]
    fn test_display_invalid_manifest() {
        let err = PluginError::InvalidManifest("bad version".into());
        assert_eq!(err.to_string(), "invalid manifest: bad version");
    }

    // ── From conversions ──────────────────────────────────────────────

    #[test]
    fn test_from_script_error() {
        let err: PluginError = ScriptError::Compile("eof".into()).into();
        assert!(matches!(err, PluginError::Compile(ref m) if m == "eof"));
        let err: PluginError = ScriptError::Throw("oops".into()).into();
        assert!(matches!(err, PluginError::Throw(ref m) if m == "oops"));
    }

    #[test]
    fn test_from_prop_error() {
        let err: PluginError = PropError::Zombie.into();
        assert!(matches!(err, PluginError::Prop(PropError::Zombie)));
        assert_eq!(err.to_string(), "property error: property has been destroyed");
    }

    #[test]
    fn test_from_regex_error() {
        let re_err = regex::Regex::new("(unclosed").unwrap_err();
        let err: PluginError = re_err.into();
        assert!(matches!(err, PluginError::Pattern(_)));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file missing");
        let err: PluginError = io_err.into();
        assert!(matches!(err, PluginError::Io(_)));
        assert!(err.to_string().contains("file missing"));
    }

    #[test]
    fn test_from_toml_error() {
        let toml_err = toml::from_str::<toml::Value>("= bad").unwrap_err();
        let err: PluginError = toml_err.into();
        assert!(matches!(err, PluginError::TomlParse(_)));
    }

    #[test]
    fn test_from_semver_error() {
        let sv_err = "not.a.version".parse::<semver::Version>().unwrap_err();
        let err: PluginError = sv_err.into();
        assert!(matches!(err, PluginError::Semver(_)));
    }

    // ── Error trait source chain ──────────────────────────────────────

    #[test]
    fn test_error_source_io() {
        use std::error::Error;
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe broken");
        let err: PluginError = io_err.into();
        assert!(err.source().is_some());
    }

    #[test]
    fn test_error_source_string_variants() {
        use std::error::Error;
        let err = PluginError::Sandbox("trap".into());
        assert!(err.source().is_none());
    }
}
