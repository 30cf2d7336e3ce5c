//! Resolved runtime configuration.
//!
//! `settings` holds what the file says; this module holds what the process
//! actually runs with after environment overrides and validation.

mod engine;
pub(crate) mod helpers;
mod projects;

pub use engine::EngineConfig;
pub use projects::{ProjectConfig, ProjectsConfig};

use crate::error::ConfigError;
use crate::settings::Settings;

#[derive(Debug, Clone)]
pub struct Config {
    pub engine: EngineConfig,
    pub projects: ProjectsConfig,
}

impl Config {
    pub fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self {
            engine: EngineConfig::resolve(settings)?,
            projects: ProjectsConfig::resolve(settings)?,
        })
    }
}
