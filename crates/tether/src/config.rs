//! Configuration
//!
//! Two concerns live here:
//!
//! - [`Settings`]: process-wide settings, layered with figment
//!   (defaults → `tether.toml` → `TETHER_*` environment variables).
//! - [`parse_config`]: per-worker configuration text (JSON or TOML),
//!   turned into a [`Value`] the worker and its hooks can read.

use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tether_types::Value;

use crate::error::ConfigError;
use crate::hooks::RolePolicy;
use crate::lifecycle::{AfterRunOrder, RunMode};

pub const DEFAULT_SETTINGS_FILE: &str = "tether.toml";
const ENV_PREFIX: &str = "TETHER_";

// ─────────────────────────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Tracing filter directive.
    pub log: String,
    /// Interpreter kind used when a worker does not name one.
    pub interpreter: String,
    pub run_mode: RunMode,
    pub role_policy: RolePolicy,
    pub after_run_order: AfterRunOrder,
    pub storage_path: PathBuf,
    /// Resource prefixes granted to `request_permission`. `*` grants all.
    pub permissions: Vec<String>,
    pub terminal: TerminalSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalSettings {
    /// Write the prompt passed to `read` before waiting for input.
    pub echo: bool,
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self { echo: true }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log: "tether=info".to_string(),
            interpreter: crate::interpreter::SHELL_KIND.to_string(),
            run_mode: RunMode::Sync,
            role_policy: RolePolicy::Reject,
            after_run_order: AfterRunOrder::CallbacksFirst,
            storage_path: PathBuf::from("./data/tether.redb"),
            permissions: Vec::new(),
            terminal: TerminalSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings. `path` overrides the default settings file; a
    /// missing file is not an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_FILE));
        Self::figment(&file)
            .extract()
            .map_err(|e| ConfigError::Settings(Box::new(e)))
    }

    fn figment(file: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Whether `request_permission(resource)` should be granted. A grant
    /// covers itself and whatever lies past a `/` or `:` boundary below it.
    /// A resource with a `..` segment is never granted.
    pub fn permits(&self, resource: &str) -> bool {
        if resource.split(['/', '\\', ':']).any(|segment| segment == "..") {
            return false;
        }
        self.permissions
            .iter()
            .any(|granted| granted == "*" || covers(granted, resource))
    }
}

fn covers(granted: &str, resource: &str) -> bool {
    match resource.strip_prefix(granted) {
        Some("") => true,
        Some(rest) => granted.ends_with(['/', ':']) || rest.starts_with(['/', ':']),
        None => false,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker configuration
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Toml,
}

impl ConfigFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigFormat::Json => "json",
            ConfigFormat::Toml => "toml",
        }
    }

    /// Format implied by a URL or path extension.
    pub fn from_url(url: &str) -> Option<Self> {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        match Path::new(path).extension()?.to_str()? {
            "json" => Some(ConfigFormat::Json),
            "toml" => Some(ConfigFormat::Toml),
            _ => None,
        }
    }

    /// Best guess for inline text: JSON if it looks like an object.
    pub fn detect(text: &str) -> Self {
        if text.trim_start().starts_with('{') {
            ConfigFormat::Json
        } else {
            ConfigFormat::Toml
        }
    }
}

/// Where a worker's configuration comes from.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// Raw text. The format is detected when not given.
    Inline {
        text: String,
        format: Option<ConfigFormat>,
    },
    /// Fetched; the format follows the extension.
    Url(String),
    /// Already parsed.
    Value(Value),
}

/// Parse configuration text into a mapping.
pub fn parse_config(text: &str, format: ConfigFormat, url: Option<&str>) -> Result<Value, ConfigError> {
    let fail = |message: String| ConfigError::Parse {
        format: format.as_str(),
        url: url.map(str::to_string),
        message,
    };
    let json = match format {
        ConfigFormat::Json => serde_json::from_str::<serde_json::Value>(text).map_err(|e| fail(e.to_string()))?,
        ConfigFormat::Toml => {
            let table: toml::Table = toml::from_str(text).map_err(|e| fail(e.message().to_string()))?;
            serde_json::to_value(table).map_err(|e| fail(e.to_string()))?
        }
    };
    if !json.is_object() {
        return Err(fail("expected a table at the top level".to_string()));
    }
    Ok(Value::from_json(json))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_and_toml() {
        let json = parse_config(r#"{"name": "demo", "packages": ["a", "b"]}"#, ConfigFormat::Json, None).unwrap();
        assert_eq!(json.get("name"), Some(Value::str("demo")));
        assert_eq!(json.get("packages").and_then(|p| p.index(1)), Some(Value::str("b")));

        let toml = parse_config("name = \"demo\"\n[vars]\ngreeting = \"hi\"\n", ConfigFormat::Toml, None).unwrap();
        assert_eq!(
            toml.get("vars").and_then(|v| v.get("greeting")),
            Some(Value::str("hi"))
        );
    }

    #[test]
    fn test_parse_error_carries_url() {
        let err = parse_config("{ not json", ConfigFormat::Json, Some("file:///conf.json")).unwrap_err();
        match &err {
            ConfigError::Parse { format, url, .. } => {
                assert_eq!(*format, "json");
                assert_eq!(url.as_deref(), Some("file:///conf.json"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.to_string().contains("at file:///conf.json"));

        assert!(parse_config("[1, 2]", ConfigFormat::Json, None).is_err());
        assert!(parse_config("name = ", ConfigFormat::Toml, None).is_err());
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(ConfigFormat::from_url("conf/app.toml"), Some(ConfigFormat::Toml));
        assert_eq!(ConfigFormat::from_url("file:///a/b.json?x=1"), Some(ConfigFormat::Json));
        assert_eq!(ConfigFormat::from_url("app.yaml"), None);
        assert_eq!(ConfigFormat::detect("  {\"a\": 1}"), ConfigFormat::Json);
        assert_eq!(ConfigFormat::detect("a = 1"), ConfigFormat::Toml);
    }

    #[test]
    fn test_settings_from_file_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether.toml");
        std::fs::write(
            &path,
            "after_run_order = \"code_first\"\npermissions = [\"/data\"]\n[terminal]\necho = false\n",
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.after_run_order, AfterRunOrder::CodeFirst);
        assert!(!settings.terminal.echo);
        assert_eq!(settings.interpreter, "shell");
        assert!(settings.permits("/data/notes.txt"));
        assert!(!settings.permits("/etc/passwd"));
    }

    #[test]
    fn test_permissions_stop_at_boundaries() {
        let settings = Settings {
            permissions: vec!["/data".to_string(), "net:".to_string(), "fs:/tmp/".to_string()],
            ..Settings::default()
        };
        assert!(settings.permits("/data"));
        assert!(settings.permits("/data/notes.txt"));
        assert!(settings.permits("net:example.com"));
        assert!(settings.permits("fs:/tmp/scratch"));

        assert!(!settings.permits("/database/secrets"));
        assert!(!settings.permits("/data-old"));
        assert!(!settings.permits("/data/../etc/passwd"));
        assert!(!settings.permits("fs:/tmp/../etc"));
        assert!(!settings.permits("fs:/tmp"));
        assert!(!settings.permits("network:example.com"));
    }

    #[test]
    fn test_missing_settings_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(settings.role_policy, RolePolicy::Reject);
        assert!(settings.terminal.echo);
    }

    #[test]
    fn test_wildcard_permission() {
        let settings = Settings {
            permissions: vec!["*".to_string()],
            ..Settings::default()
        };
        assert!(settings.permits("anything"));
        assert!(!Settings::default().permits("anything"));
    }
}
