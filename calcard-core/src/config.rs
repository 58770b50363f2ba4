//! Server configuration.

use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_MAX_INSTANCES;
use crate::error::{CalCardError, CalCardResult};

/// Sentinel `database` value selecting the in-process store.
pub const IN_MEMORY_DATABASE: &str = ":memory:";

const ENV_PREFIX: &str = "CALCARD";

fn default_bind() -> String {
    "127.0.0.1:4096".to_string()
}

fn default_database() -> String {
    dirs::data_dir()
        .map(|dir| dir.join("calcard").join("calcard.sqlite3"))
        .unwrap_or_else(|| PathBuf::from("calcard.sqlite3"))
        .to_string_lossy()
        .into_owned()
}

fn default_max_instances() -> u16 {
    DEFAULT_MAX_INSTANCES
}

fn default_log_filter() -> String {
    "info,calcard_core=debug".to_string()
}

/// Configuration at ~/.config/calcard/config.toml, overridden by
/// `CALCARD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    /// SQLite path (`~` allowed) or `:memory:`
    #[serde(default = "default_database")]
    pub database: String,

    /// Per-master cap on generated occurrences
    #[serde(default = "default_max_instances")]
    pub max_instances_per_series: u16,

    /// Change records older than this are pruned at startup; 0 keeps everything
    #[serde(default)]
    pub change_retention_days: u32,

    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: default_bind(),
            database: default_database(),
            max_instances_per_series: default_max_instances(),
            change_retention_days: 0,
            log_filter: default_log_filter(),
        }
    }
}

/// Where the component store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
    Memory,
    Sqlite(PathBuf),
}

impl ServerConfig {
    pub fn config_path() -> CalCardResult<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| CalCardError::Config("Could not determine config directory".into()))?
            .join("calcard");

        Ok(config_dir.join("config.toml"))
    }

    /// Load from `path` (or the default location), then the environment.
    /// A missing file is not an error.
    pub fn load(path: Option<&Path>) -> CalCardResult<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::config_path()?,
        };
        Self::load_with_env(&path, ENV_PREFIX)
    }

    fn load_with_env(path: &Path, env_prefix: &str) -> CalCardResult<Self> {
        let config: ServerConfig = Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(Environment::with_prefix(env_prefix).try_parsing(true))
            .build()
            .map_err(|e| CalCardError::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| CalCardError::Config(e.to_string()))?;

        if config.max_instances_per_series == 0 {
            return Err(CalCardError::Config(
                "max_instances_per_series must be at least 1".into(),
            ));
        }
        Ok(config)
    }

    pub fn database_location(&self) -> DatabaseLocation {
        if self.database.trim() == IN_MEMORY_DATABASE {
            return DatabaseLocation::Memory;
        }
        DatabaseLocation::Sqlite(PathBuf::from(
            shellexpand::tilde(self.database.trim()).into_owned(),
        ))
    }

    /// The effective configuration as TOML.
    pub fn to_toml(&self) -> CalCardResult<String> {
        toml::to_string_pretty(self).map_err(|e| CalCardError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A prefix nothing sets, so the developer's environment cannot leak in
    const TEST_PREFIX: &str = "CALCARD_CONFIG_TEST_UNSET";

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            ServerConfig::load_with_env(&dir.path().join("absent.toml"), TEST_PREFIX).unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.max_instances_per_series, DEFAULT_MAX_INSTANCES);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "bind = \"0.0.0.0:8080\"\ndatabase = \":memory:\"\nchange_retention_days = 30\n",
        )
        .unwrap();

        let config = ServerConfig::load_with_env(&path, TEST_PREFIX).unwrap();
        assert_eq!(config.bind, "0.0.0.0:8080");
        assert_eq!(config.change_retention_days, 30);
        assert_eq!(config.database_location(), DatabaseLocation::Memory);
        assert_eq!(config.log_filter, default_log_filter());
    }

    #[test]
    fn test_zero_instance_cap_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "max_instances_per_series = 0\n").unwrap();
        assert!(matches!(
            ServerConfig::load_with_env(&path, TEST_PREFIX),
            Err(CalCardError::Config(_))
        ));
    }

    #[test]
    fn test_database_path_expands_tilde() {
        let config = ServerConfig {
            database: "~/calcard/test.sqlite3".into(),
            ..Default::default()
        };
        match config.database_location() {
            DatabaseLocation::Sqlite(path) => {
                assert!(!path.to_string_lossy().starts_with('~'));
                assert!(path.ends_with("calcard/test.sqlite3"));
            }
            DatabaseLocation::Memory => panic!("expected a file database"),
        }
    }

    #[test]
    fn test_toml_round_trip() {
        let config = ServerConfig::default();
        let rendered = config.to_toml().unwrap();
        let parsed: ServerConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }
}
