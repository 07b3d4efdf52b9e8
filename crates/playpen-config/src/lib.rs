#![warn(missing_docs)]

//! # playpen-config
//!
//! Configuration loading for the playpen script sandbox.
//!
//! Supports TOML configuration files with environment variable expansion.
//!
//! ## Example
//!
//! ```toml
//! [sandbox]
//! allowed_time_ms = 2000
//! max_code_size_kb = 64
//! recursion_limit = 512
//! debug_transformed = false
//!
//! [entry_points]
//! setup = "startLevel"
//! post_check = "validateLevel"
//! exit_hook = "onExit"
//! objective = "objective"
//!
//! [level]
//! width = 50
//! height = 25
//! allow_auxiliary_view = false
//! reduced_integrity = "${PLAYPEN_QUICK_CALLBACKS}"
//! ```

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level playpen configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlaypenConfig {
    /// Sandbox execution settings.
    #[serde(default)]
    pub sandbox: SandboxOverrides,

    /// Names of the functions a level script declares.
    #[serde(default)]
    pub entry_points: EntryPointOverrides,

    /// Defaults for the grid level used by the command-line runner.
    #[serde(default)]
    pub level: LevelOverrides,
}

/// Sandbox configuration overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SandboxOverrides {
    /// Maximum wall-clock time a single loop may run, in milliseconds.
    #[serde(default)]
    pub allowed_time_ms: Option<u64>,

    /// Maximum size of a level script in kilobytes.
    #[serde(default)]
    pub max_code_size_kb: Option<usize>,

    /// Maximum call depth inside the interpreter.
    #[serde(default)]
    pub recursion_limit: Option<usize>,

    /// Maximum interpreter value-stack size.
    #[serde(default)]
    pub stack_size_limit: Option<usize>,

    /// Log the instrumented source of every submission at debug level.
    #[serde(default)]
    pub debug_transformed: Option<bool>,
}

/// Entry-point name overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntryPointOverrides {
    /// Required setup function.
    #[serde(default)]
    pub setup: Option<String>,

    /// Optional post-check function.
    #[serde(default)]
    pub post_check: Option<String>,

    /// Optional exit hook.
    #[serde(default)]
    pub exit_hook: Option<String>,

    /// Optional objective predicate.
    #[serde(default)]
    pub objective: Option<String>,
}

/// Grid level defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LevelOverrides {
    /// Grid width in cells.
    #[serde(default)]
    pub width: Option<u32>,

    /// Grid height in cells.
    #[serde(default)]
    pub height: Option<u32>,

    /// Expose the read-only DOM view to level scripts.
    #[serde(default, deserialize_with = "flexible_bool")]
    pub allow_auxiliary_view: Option<bool>,

    /// Skip post-check and tamper detection on callbacks.
    #[serde(default, deserialize_with = "flexible_bool")]
    pub reduced_integrity: Option<bool>,
}

impl PlaypenConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: PlaypenConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let sandbox = &self.sandbox;
        if sandbox.allowed_time_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.allowed_time_ms must be greater than zero".into(),
            ));
        }
        if sandbox.max_code_size_kb == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.max_code_size_kb must be greater than zero".into(),
            ));
        }
        if sandbox.recursion_limit == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.recursion_limit must be greater than zero".into(),
            ));
        }

        let names = [
            ("setup", &self.entry_points.setup),
            ("post_check", &self.entry_points.post_check),
            ("exit_hook", &self.entry_points.exit_hook),
            ("objective", &self.entry_points.objective),
        ];
        let mut seen: Vec<&str> = Vec::new();
        for (field, name) in names {
            let Some(name) = name else { continue };
            if !is_identifier(name) {
                return Err(ConfigError::Invalid(format!(
                    "entry_points.{}: '{}' is not a valid identifier",
                    field, name
                )));
            }
            if seen.contains(&name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "entry_points.{}: '{}' is already used by another entry point",
                    field, name
                )));
            }
            seen.push(name);
        }

        if self.level.width == Some(0) || self.level.height == Some(0) {
            return Err(ConfigError::Invalid(
                "level dimensions must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

/// Accept `true`/`false` as booleans or strings, so flags can come from `${ENV}`.
fn flexible_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Text(String),
    }

    match Option::<Flag>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Flag::Bool(b)) => Ok(Some(b)),
        Some(Flag::Text(s)) => match s.trim() {
            "true" | "1" | "yes" => Ok(Some(true)),
            "false" | "0" | "no" | "" => Ok(Some(false)),
            other => Err(serde::de::Error::custom(format!(
                "expected a boolean, got '{other}'"
            ))),
        },
    }
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                Err(_) => {
                    // Leave the placeholder if env var not found
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(ch);
        }
    }

    result
}
