//! Project registry, validated at load.
//!
//! Each project is pinned to the canonical form of its configured path.
//! The supervisor re-resolves the path before every spawn and refuses to run
//! if the canonical form no longer matches (symlink swap, deleted dir).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::ConfigError;
use crate::settings::Settings;

#[derive(Debug, Clone)]
pub struct ProjectConfig {
    pub alias: String,
    /// Canonical real path, resolved once at load.
    pub path: PathBuf,
    pub description: Option<String>,
    pub skip_permissions: bool,
    pub skip_permissions_reason: Option<String>,
    pub token_budget: Option<u64>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct ProjectsConfig {
    projects: BTreeMap<String, Arc<ProjectConfig>>,
}

impl ProjectsConfig {
    pub fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let mut projects = BTreeMap::new();
        for (alias, p) in &settings.projects {
            let configured = PathBuf::from(&p.path);
            if !configured.is_absolute() {
                return Err(ConfigError::InvalidProject {
                    alias: alias.clone(),
                    message: format!("path must be absolute, got {:?}", p.path),
                });
            }
            let canonical = configured
                .canonicalize()
                .map_err(|e| ConfigError::InvalidProject {
                    alias: alias.clone(),
                    message: format!("path {:?} cannot be resolved: {e}", p.path),
                })?;
            if !canonical.is_dir() {
                return Err(ConfigError::InvalidProject {
                    alias: alias.clone(),
                    message: format!("path {:?} is not a directory", p.path),
                });
            }
            if p.skip_permissions {
                match p.skip_permissions_reason.as_deref().map(str::trim) {
                    Some(reason) if !reason.is_empty() => {}
                    _ => {
                        return Err(ConfigError::InvalidProject {
                            alias: alias.clone(),
                            message: "skip_permissions requires a non-empty \
                                      skip_permissions_reason"
                                .to_string(),
                        });
                    }
                }
            }
            if p.token_budget == Some(0) {
                return Err(ConfigError::InvalidProject {
                    alias: alias.clone(),
                    message: "token_budget must be positive".to_string(),
                });
            }
            if p.timeout_ms == Some(0) {
                return Err(ConfigError::InvalidProject {
                    alias: alias.clone(),
                    message: "timeout_ms must be positive".to_string(),
                });
            }
            projects.insert(
                alias.clone(),
                Arc::new(ProjectConfig {
                    alias: alias.clone(),
                    path: canonical,
                    description: p.description.clone(),
                    skip_permissions: p.skip_permissions,
                    skip_permissions_reason: p.skip_permissions_reason.clone(),
                    token_budget: p.token_budget,
                    timeout_ms: p.timeout_ms,
                }),
            );
        }
        Ok(Self { projects })
    }

    pub fn get(&self, alias: &str) -> Option<Arc<ProjectConfig>> {
        self.projects.get(alias).cloned()
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.projects.contains_key(alias)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ProjectConfig>> {
        self.projects.values()
    }

    pub fn len(&self) -> usize {
        self.projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ProjectSettings;

    fn settings_with(alias: &str, p: ProjectSettings) -> Settings {
        let mut s = Settings::default();
        s.projects.insert(alias.to_string(), p);
        s
    }

    fn base_project(path: &str) -> ProjectSettings {
        ProjectSettings {
            path: path.to_string(),
            description: None,
            skip_permissions: false,
            skip_permissions_reason: None,
            token_budget: None,
            timeout_ms: None,
        }
    }

    #[test]
    fn resolves_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings_with("alpha", base_project(dir.path().to_str().unwrap()));
        let cfg = ProjectsConfig::resolve(&s).unwrap();
        let p = cfg.get("alpha").unwrap();
        assert_eq!(p.path, dir.path().canonicalize().unwrap());
    }

    #[test]
    fn rejects_missing_directory() {
        let s = settings_with("alpha", base_project("/definitely/not/here"));
        assert!(ProjectsConfig::resolve(&s).is_err());
    }

    #[test]
    fn rejects_relative_path() {
        let s = settings_with("alpha", base_project("relative/path"));
        assert!(ProjectsConfig::resolve(&s).is_err());
    }

    #[test]
    fn skip_permissions_requires_reason() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = base_project(dir.path().to_str().unwrap());
        p.skip_permissions = true;
        p.skip_permissions_reason = Some("   ".to_string());
        let s = settings_with("alpha", p);
        assert!(ProjectsConfig::resolve(&s).is_err());
    }

    #[test]
    fn zero_budget_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = base_project(dir.path().to_str().unwrap());
        p.token_budget = Some(0);
        assert!(ProjectsConfig::resolve(&settings_with("alpha", p)).is_err());
    }
}
