//! # pinctl-config
//!
//! Configuration file and logging setup shared by pinctl tools.
//!
//! ```toml
//! [device]
//! path = "/dev/spidev0.0"
//! read_only = false
//!
//! [log]
//! level = "debug"
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "PINCTL_CONFIG";

const CONFIG_FILE: &str = "config.toml";

static GLOBAL: OnceCell<Config> = OnceCell::new();

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub log: LogConfig,
}

/// Default device node for tools that take `--device`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub path: Option<PathBuf>,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// An `EnvFilter` directive such as `info` or `pinctl_ioctl=trace`.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load from `$PINCTL_CONFIG` or the user config directory.
    ///
    /// A missing file yields defaults; an unreadable or malformed one is an
    /// error.
    pub fn load() -> Result<Self> {
        match resolve_path(std::env::var_os(CONFIG_ENV).map(PathBuf::from)) {
            Some(path) => Self::load_or_default(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load from an explicit file, which must exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(path)
    }

    /// Process-wide config, loaded on first use.
    pub fn global() -> Result<&'static Self> {
        GLOBAL.get_or_try_init(Self::load)
    }
}

/// Where the config file lives: an explicit override, else
/// `<config_dir>/pinctl/config.toml`.
pub fn resolve_path(explicit: Option<PathBuf>) -> Option<PathBuf> {
    explicit.or_else(|| dirs::config_dir().map(|dir| dir.join("pinctl").join(CONFIG_FILE)))
}

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` wins over `log.level`. Returns `false` if a subscriber was
/// already installed.
pub fn init_logging(log: &LogConfig) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.device.path, None);
        assert!(!config.device.read_only);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_load_full_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[device]\npath = \"/dev/spidev0.0\"\nread_only = true\n\n[log]\nlevel = \"pinctl_ioctl=trace\""
        )
        .unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.device.path, Some(PathBuf::from("/dev/spidev0.0")));
        assert!(config.device.read_only);
        assert_eq!(config.log.level, "pinctl_ioctl=trace");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[device]\nread_only = true").unwrap();

        let config = Config::load_from(file.path()).unwrap();
        assert!(config.device.read_only);
        assert_eq!(config.device.path, None);
        assert_eq!(config.log, LogConfig::default());
    }

    #[test]
    fn test_malformed_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[device\npath = 3").unwrap();

        let err = Config::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("invalid config"));
    }

    #[test]
    fn test_load_from_missing_is_error() {
        let dir = TempDir::new().unwrap();
        let err = Config::load_from(&dir.path().join(CONFIG_FILE)).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_or_default(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_resolve_path() {
        let explicit = PathBuf::from("/etc/pinctl.toml");
        assert_eq!(resolve_path(Some(explicit.clone())), Some(explicit));

        if let Some(path) = resolve_path(None) {
            assert!(path.ends_with("pinctl/config.toml"));
        }
    }

    #[test]
    fn test_round_trip_through_toml() {
        let config = Config {
            device: DeviceConfig {
                path: Some(PathBuf::from("/dev/i2c-1")),
                read_only: false,
            },
            log: LogConfig {
                level: "warn".to_string(),
            },
        };
        let text = toml::to_string(&config).unwrap();
        assert_eq!(toml::from_str::<Config>(&text).unwrap(), config);
    }
}
