//! Engine runtime configuration.
//!
//! Resolution order: environment variable, then settings file, then the
//! built-in default baked into `EngineSettings::default`.

use std::path::PathBuf;
use std::time::Duration;

use crate::config::helpers::env_or;
use crate::error::ConfigError;
use crate::settings::Settings;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_concurrent_tasks: usize,
    pub max_queued_per_project: u32,
    pub default_token_budget: u64,
    pub default_timeout: Duration,
    pub silence_timeout: Duration,
    pub approval_timeout: Duration,
    pub replay_timeout: Duration,
    pub summarizer_enabled: bool,
    pub agent_bin: String,
    pub api_key_env: String,
    pub uploads_root: PathBuf,
    /// Scheduler tick period. Not an advertised knob; fixed at ~2s.
    pub tick_interval: Duration,
    /// How long `stop()` waits for in-flight runs before aborting them.
    pub shutdown_grace: Duration,
}

impl EngineConfig {
    pub fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let e = &settings.engine;
        let max_concurrent_tasks = env_or("MAX_CONCURRENT_TASKS", e.max_concurrent_tasks)?;
        if max_concurrent_tasks == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAX_CONCURRENT_TASKS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(Self {
            max_concurrent_tasks,
            max_queued_per_project: env_or("MAX_QUEUED_PER_PROJECT", e.max_queued_per_project)?,
            default_token_budget: env_or("DEFAULT_TOKEN_BUDGET", e.default_token_budget)?,
            default_timeout: Duration::from_millis(env_or(
                "DEFAULT_TIMEOUT_MS",
                e.default_timeout_ms,
            )?),
            silence_timeout: Duration::from_millis(env_or(
                "SILENCE_TIMEOUT_MS",
                e.silence_timeout_ms,
            )?),
            approval_timeout: Duration::from_millis(env_or(
                "APPROVAL_TIMEOUT_MS",
                e.approval_timeout_ms,
            )?),
            replay_timeout: Duration::from_millis(env_or(
                "REPLAY_TIMEOUT_MS",
                e.replay_timeout_ms,
            )?),
            summarizer_enabled: env_or("SUMMARIZER_ENABLED", e.summarizer_enabled)?,
            agent_bin: env_or("AGENT_BIN", e.agent_bin.clone())?,
            api_key_env: e.api_key_env.clone(),
            uploads_root: PathBuf::from(&e.uploads_dir),
            tick_interval: Duration::from_secs(2),
            shutdown_grace: Duration::from_secs(15),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_defaults() {
        let cfg = EngineConfig::resolve(&Settings::default()).unwrap();
        assert_eq!(cfg.max_concurrent_tasks, 3);
        assert_eq!(cfg.default_timeout, Duration::from_secs(600));
        assert_eq!(cfg.replay_timeout, Duration::from_secs(120));
        assert_eq!(cfg.agent_bin, "claude");
    }

    // the env-override plumbing itself is covered by config::helpers tests
    // against scratch variable names; touching the real keys here would race
    // with concurrently running engine tests that resolve this config

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut settings = Settings::default();
        settings.engine.max_concurrent_tasks = 0;
        assert!(EngineConfig::resolve(&settings).is_err());
    }
}
