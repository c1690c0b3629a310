// Engine configuration.
//
// Loaded from an explicit --config path or the default
// ~/.config/provsync/config.toml; a missing default file just yields the
// built-in defaults. CLI flags take precedence over file values.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_max_sync_duration_secs() -> u64 {
    3600
}

fn default_session_retention_days() -> i64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root for databases, stores, and package artifacts.
    pub data_dir: Option<PathBuf>,

    /// Sync sessions exceeding this limit are forced to `error`.
    #[serde(default = "default_max_sync_duration_secs")]
    pub max_sync_duration_secs: u64,

    /// Finished sessions older than this are purged on maintenance runs.
    #[serde(default = "default_session_retention_days")]
    pub session_retention_days: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            max_sync_duration_secs: default_max_sync_duration_secs(),
            session_retention_days: default_session_retention_days(),
        }
    }
}

impl Config {
    /// Default config file location.
    pub fn config_path() -> Result<PathBuf> {
        let base = dirs::config_dir().ok_or_else(|| {
            EngineError::Config("cannot determine the user config directory".to_string())
        })?;
        Ok(base.join("provsync").join("config.toml"))
    }

    /// Load configuration. An explicit path must exist and parse; the
    /// default path is optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(EngineError::Config(format!(
                        "config file not found: {}",
                        path.display()
                    )));
                }
                path.to_path_buf()
            }
            None => {
                let path = Self::config_path()?;
                if !path.exists() {
                    return Ok(Self::default());
                }
                path
            }
        };

        let raw = std::fs::read_to_string(&path)?;
        let config: Config = toml::from_str(&raw)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Resolve the effective data directory: flag beats file beats the
    /// platform data dir.
    pub fn resolve_data_dir(&self, flag: Option<&Path>) -> Result<PathBuf> {
        if let Some(dir) = flag {
            return Ok(dir.to_path_buf());
        }
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        let base = dirs::data_dir().ok_or_else(|| {
            EngineError::Config("cannot determine the user data directory".to_string())
        })?;
        Ok(base.join("provsync"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.max_sync_duration_secs, 3600);
        assert_eq!(config.session_retention_days, 30);
        assert!(config.data_dir.is_none());
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "data_dir = \"/srv/provsync\"\nmax_sync_duration_secs = 120\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.data_dir, Some(PathBuf::from("/srv/provsync")));
        assert_eq!(config.max_sync_duration_secs, 120);
        // Unset keys fall back to defaults
        assert_eq!(config.session_retention_days, 30);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(Config::load(Some(&dir.path().join("nope.toml"))).is_err());
    }

    #[test]
    fn test_data_dir_precedence() {
        let config = Config {
            data_dir: Some(PathBuf::from("/from/file")),
            ..Config::default()
        };
        assert_eq!(
            config
                .resolve_data_dir(Some(Path::new("/from/flag")))
                .unwrap(),
            PathBuf::from("/from/flag")
        );
        assert_eq!(
            config.resolve_data_dir(None).unwrap(),
            PathBuf::from("/from/file")
        );
    }
}
