//! Configuration management for the updater.
//!
//! Loads configuration from a TOML file with environment variable overrides
//! (`UPDATER_<SECTION>__<KEY>`, e.g. `UPDATER_TRANSPORT__TIMEOUT_SECS=60`).

use crate::transport::{TransportOptions, DEFAULT_CHUNK_SIZE};
use crate::{Result, UpdateError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub updater: UpdaterConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// Which executables are started again after a successful replace
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    /// Every executable target
    #[default]
    All,
    /// Only executables that were running when the run began
    PreviouslyRunning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// Manifest locator, a URL or a local path
    #[serde(default = "default_manifest")]
    pub manifest: String,

    #[serde(default)]
    pub restart: RestartPolicy,

    /// Files downloaded at once (1 = sequential)
    #[serde(default = "default_max_parallel_downloads")]
    pub max_parallel_downloads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Connect and read timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Streaming window in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Wait after each terminated process, in milliseconds
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_manifest() -> String {
    "update_config.json".to_string()
}

fn default_max_parallel_downloads() -> usize {
    1
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_user_agent() -> String {
    format!("program-updater/{}", env!("CARGO_PKG_VERSION"))
}

fn default_grace_period_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            manifest: default_manifest(),
            restart: RestartPolicy::default(),
            max_parallel_downloads: default_max_parallel_downloads(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            chunk_size: default_chunk_size(),
            user_agent: default_user_agent(),
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, whatever its extension
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| UpdateError::Config(format!("{}: {}", path.display(), e)))?;
        toml::from_str(&content)
            .map_err(|e| UpdateError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Layer `UPDATER_*` environment overrides over a file, or over the
    /// defaults when no file is given. A named file must exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        config::Config::builder()
            .add_source(
                config::Config::try_from(&base)
                    .map_err(|e| UpdateError::Config(e.to_string()))?,
            )
            .add_source(
                config::Environment::with_prefix("UPDATER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|layered| layered.try_deserialize())
            .map_err(|e| UpdateError::Config(e.to_string()))
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            timeout: Duration::from_secs(self.transport.timeout_secs.max(1)),
            chunk_size: self.transport.chunk_size.max(1),
            user_agent: self.transport.user_agent.clone(),
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.process.grace_period_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.updater.manifest, "update_config.json");
        assert_eq!(config.updater.restart, RestartPolicy::All);
        assert_eq!(config.updater.max_parallel_downloads, 1);
        assert_eq!(config.transport_options().timeout, Duration::from_secs(30));
        assert_eq!(config.transport_options().chunk_size, 8192);
        assert_eq!(config.grace_period(), Duration::from_secs(1));
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[updater]
manifest = "https://updates.example.com/update_config.json"
restart = "previously_running"

[process]
grace_period_ms = 250
"#
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(
            config.updater.manifest,
            "https://updates.example.com/update_config.json"
        );
        assert_eq!(config.updater.restart, RestartPolicy::PreviouslyRunning);
        assert_eq!(config.grace_period(), Duration::from_millis(250));
        assert_eq!(config.transport.timeout_secs, 30);
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[updater]\nrestart = \"sometimes\"").unwrap();
        assert!(matches!(
            Config::from_file(file.path()),
            Err(UpdateError::Config(_))
        ));
    }

    #[test]
    fn test_load_reads_file_without_toml_extension() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("updater.conf");
        std::fs::write(
            &path,
            "[updater]\nmanifest = \"ftp://updates.example.com/update_config.json\"\nmax_parallel_downloads = 4\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(
            config.updater.manifest,
            "ftp://updates.example.com/update_config.json"
        );
        assert_eq!(config.updater.max_parallel_downloads, 4);
        assert_eq!(config.process.grace_period_ms, 1000);
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = Config::load(Some(&dir.path().join("absent.toml")));
        assert!(matches!(result, Err(UpdateError::Config(_))));
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = Config::load(None).unwrap();
        assert!(config.updater.max_parallel_downloads >= 1);
        assert!(!config.transport.user_agent.is_empty());
    }
}
