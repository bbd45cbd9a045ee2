//! Engine configuration: TOML file plus environment overrides.
//!
//! ```toml
//! [policy]
//! allowed_modules = ["requests", "bs4", "json", "re"]
//!
//! [runner]
//! python_path = "/usr/bin/python3"
//! default_timeout_ms = 20000
//! max_workers = 8
//!
//! [refinement]
//! max_iterations = 5
//! ```
//!
//! Every table and field is optional. After the file, the variables
//! `SMARTSCRAPE_PYTHON`, `SMARTSCRAPE_TIMEOUT_MS`,
//! `SMARTSCRAPE_MAX_ITERATIONS` and `SMARTSCRAPE_WORKERS` win.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::diagnostics::ReporterConfig;
use crate::sandbox::{RunnerConfig, WhitelistPolicy};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: &'static str, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Refinement loop bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefinementConfig {
    /// Revisions a session may run (the initial one included) before `Fatal`.
    pub max_iterations: u32,
    /// Stop early when a repair reproduces the same source and diagnostic.
    pub detect_no_progress: bool,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            detect_no_progress: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub policy: WhitelistPolicy,
    pub runner: RunnerConfig,
    pub refinement: RefinementConfig,
    pub reporter: ReporterConfig,
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&raw)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(python) = lookup("SMARTSCRAPE_PYTHON").filter(|v| !v.is_empty()) {
            self.runner.python_path = python;
        }
        if let Some(ms) = parse_env(&lookup, "SMARTSCRAPE_TIMEOUT_MS")? {
            self.runner.default_timeout_ms = ms;
        }
        if let Some(n) = parse_env(&lookup, "SMARTSCRAPE_MAX_ITERATIONS")? {
            self.refinement.max_iterations = n;
        }
        if let Some(n) = parse_env(&lookup, "SMARTSCRAPE_WORKERS")? {
            self.runner.max_workers = n;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.refinement.max_iterations == 0 {
            return Err(ConfigError::Invalid(
                "refinement.max_iterations must be at least 1".to_string(),
            ));
        }
        if self.runner.max_workers == 0 {
            return Err(ConfigError::Invalid(
                "runner.max_workers must be at least 1".to_string(),
            ));
        }
        if self.runner.default_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "runner.default_timeout_ms must be positive".to_string(),
            ));
        }
        if self.runner.python_path.trim().is_empty() {
            return Err(ConfigError::Invalid("runner.python_path is empty".to_string()));
        }
        if self.policy.allowed_modules.is_empty() {
            return Err(ConfigError::Invalid(
                "policy.allowed_modules is empty; no script could import anything".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { key, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.refinement.max_iterations, 3);
        assert_eq!(config.runner.python_path, "python3");
    }

    #[test]
    fn test_partial_tables() {
        let config = EngineConfig::from_toml_str(
            "[runner]\nmax_workers = 8\n\n[refinement]\nmax_iterations = 5\n",
        )
        .unwrap();
        assert_eq!(config.runner.max_workers, 8);
        assert_eq!(config.runner.default_timeout_ms, 30_000);
        assert_eq!(config.refinement.max_iterations, 5);
        assert!(config.policy.allowed_modules.contains("bs4"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = EngineConfig::default();
        config
            .apply_overrides(env(&[
                ("SMARTSCRAPE_PYTHON", "/opt/py/bin/python3"),
                ("SMARTSCRAPE_TIMEOUT_MS", "1500"),
                ("SMARTSCRAPE_MAX_ITERATIONS", "4"),
            ]))
            .unwrap();
        assert_eq!(config.runner.python_path, "/opt/py/bin/python3");
        assert_eq!(config.runner.default_timeout_ms, 1500);
        assert_eq!(config.refinement.max_iterations, 4);
        assert_eq!(config.runner.max_workers, 4);
    }

    #[test]
    fn test_bad_env_value() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_overrides(env(&[("SMARTSCRAPE_WORKERS", "many")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidEnv {
                key: "SMARTSCRAPE_WORKERS",
                ..
            }
        ));
    }

    #[test]
    fn test_validation() {
        assert!(EngineConfig::from_toml_str("[refinement]\nmax_iterations = 0\n").is_err());
        assert!(EngineConfig::from_toml_str("[runner]\nmax_workers = 0\n").is_err());
        assert!(EngineConfig::from_toml_str("[runner]\nmax_workers = \"x\"\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("smartscrape.toml");
        std::fs::write(&path, "[reporter]\nsample_chars = 500\n").unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.reporter.sample_chars, 500);

        let missing = EngineConfig::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));
    }
}
