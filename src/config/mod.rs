//! Application configuration.
//!
//! Loaded from YAML files and `PEERBUS__`-prefixed environment variables.
//! Every field has a default, so an empty source set yields a usable config.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::bus::DEFAULT_INBOUND_CAPACITY;
use crate::transport::mesh::{MeshConfig, DEFAULT_ROOT_DIR, DEFAULT_WRITE_TIMEOUT};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "peerbus.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "PEERBUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "PEERBUS";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "PEERBUS_LOG";

/// Default interval between demonstration pings.
pub const DEFAULT_PING_INTERVAL_MS: u64 = 2000;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Peer mesh transport settings.
    pub mesh: MeshSettings,
    /// Demonstration binary settings.
    pub ping: PingSettings,
}

/// Peer mesh transport settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MeshSettings {
    /// Shared directory holding every peer's socket.
    pub root_dir: PathBuf,
    /// Capacity of the bus's inbound transport channel.
    pub inbound_capacity: usize,
    /// Limit on connecting to, or writing one record to, a peer.
    pub write_timeout_ms: u64,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from(DEFAULT_ROOT_DIR),
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT.as_millis() as u64,
        }
    }
}

impl MeshSettings {
    pub fn mesh_config(&self) -> MeshConfig {
        MeshConfig::with_root_dir(&self.root_dir)
            .with_write_timeout(Duration::from_millis(self.write_timeout_ms.max(1)))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PingSettings {
    pub interval_ms: u64,
}

impl Default for PingSettings {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_PING_INTERVAL_MS,
        }
    }
}

impl PingSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `peerbus.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn parse(yaml: &str) -> Result<Config, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.mesh.root_dir, PathBuf::from("/tmp/peerbus"));
        assert_eq!(config.mesh.inbound_capacity, 256);
        assert_eq!(config.mesh.write_timeout_ms, 5000);
        assert_eq!(config.ping.interval(), Duration::from_millis(2000));
    }

    #[test]
    fn test_from_yaml_partial() {
        let yaml = r#"
mesh:
  root_dir: /var/run/peerbus
"#;
        let config = parse(yaml).unwrap();
        assert_eq!(config.mesh.root_dir, PathBuf::from("/var/run/peerbus"));
        assert_eq!(config.mesh.inbound_capacity, 256);
        assert_eq!(config.ping.interval_ms, 2000);
    }

    #[test]
    fn test_from_yaml_invalid() {
        assert!(parse("mesh: [not, a, map]").is_err());
    }

    #[test]
    fn test_load_explicit_path() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("custom.yaml");
        std::fs::write(
            &path,
            "mesh:\n  root_dir: /tmp/custom\nping:\n  interval_ms: 50\n",
        )
        .unwrap();

        let config = Config::load(Some(path.to_str().unwrap())).unwrap();

        assert_eq!(config.mesh.root_dir, PathBuf::from("/tmp/custom"));
        assert_eq!(config.ping.interval(), Duration::from_millis(50));
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let result = Config::load(Some("/nonexistent/peerbus.yaml"));
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }

    #[test]
    fn test_mesh_config_from_settings() {
        let settings = MeshSettings {
            root_dir: PathBuf::from("/tmp/x"),
            ..MeshSettings::default()
        };
        let mesh = settings.mesh_config();
        assert_eq!(mesh.root_dir, PathBuf::from("/tmp/x"));
        assert_eq!(mesh.write_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_zero_interval_clamped() {
        let ping = PingSettings { interval_ms: 0 };
        assert_eq!(ping.interval(), Duration::from_millis(1));
    }
}
