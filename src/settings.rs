//! File-backed settings.
//!
//! The TOML file is the single declarative surface; `config::*` resolves it
//! against environment overrides at startup. Unknown keys are rejected at
//! parse time so typos fail loudly instead of silently configuring nothing.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

/// Root of the settings file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    #[serde(default)]
    pub engine: EngineSettings,
    /// Configured projects, keyed by alias.
    #[serde(default)]
    pub projects: BTreeMap<String, ProjectSettings>,
}

/// Engine runtime knobs. Every field has a default; environment variables of
/// the same upper-cased name override (see `config::engine`).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineSettings {
    pub max_concurrent_tasks: usize,
    pub max_queued_per_project: u32,
    pub default_token_budget: u64,
    pub default_timeout_ms: u64,
    pub silence_timeout_ms: u64,
    pub approval_timeout_ms: u64,
    pub replay_timeout_ms: u64,
    pub summarizer_enabled: bool,
    /// Agent CLI binary name or path.
    pub agent_bin: String,
    /// Name of the environment variable carrying the Agent's API key.
    /// Only this variable (plus PATH/HOME/NODE_ENV) is forwarded to children.
    pub api_key_env: String,
    /// Root directory for validated uploads.
    pub uploads_dir: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 3,
            max_queued_per_project: 5,
            default_token_budget: 100_000,
            default_timeout_ms: 600_000,
            silence_timeout_ms: 90_000,
            approval_timeout_ms: 1_800_000,
            replay_timeout_ms: 120_000,
            summarizer_enabled: true,
            agent_bin: "claude".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            uploads_dir: "uploads".to_string(),
        }
    }
}

/// Per-project settings. The recognized keys are exactly these; anything
/// else is a config error.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectSettings {
    /// Absolute path to the project working directory.
    pub path: String,
    pub description: Option<String>,
    /// Append `--dangerously-skip-permissions` to every run for this project.
    /// Requires `skip_permissions_reason`.
    #[serde(default)]
    pub skip_permissions: bool,
    pub skip_permissions_reason: Option<String>,
    /// Token budget override (engine default applies when absent).
    pub token_budget: Option<u64>,
    /// Hard timeout override in milliseconds.
    pub timeout_ms: Option<u64>,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw, path)
    }

    /// Load the settings file if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    fn parse(raw: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}
