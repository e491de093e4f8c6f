//! Configuration for capsync
//!
//! Provides:
//! - Config file discovery (CLI flag, env var, standard paths)
//! - TOML parsing with serde
//! - Environment variable overrides

use crate::options::CaptureOptions;
use crate::wire::{HEADER_LEN, MAX_BLOCK_LEN, SP_MAX_MSG_LEN};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Complete capsync configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapsyncConfig {
    pub general: GeneralSettings,

    /// Where to find the capture worker
    pub worker: WorkerSettings,

    /// Sync pipe and lifecycle tuning
    pub sync: SyncSettings,

    /// Default options for `capture`
    pub capture: CaptureOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    /// Log level: trace, debug, info, warn, error
    pub log_level: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Explicit worker path; searched for when unset
    pub path: Option<PathBuf>,

    /// Executable name used in the search
    pub program_name: String,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            path: None,
            program_name: "dumpcap".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Largest sync pipe payload accepted
    pub max_message_len: usize,

    /// How long a graceful stop may take before the worker is killed
    pub stop_timeout_ms: u64,

    /// `waitpid` attempts when interrupted by a signal
    pub reap_retries: u32,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_message_len: SP_MAX_MSG_LEN,
            stop_timeout_ms: 500,
            reap_retries: 3,
        }
    }
}

impl SyncSettings {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Configuration loader
pub struct ConfigLoader {
    cli_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { cli_path: None }
    }

    /// Set the config path from CLI argument
    pub fn with_cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    /// Load configuration with the following precedence:
    /// 1. CLI --config flag
    /// 2. CAPSYNC_CONFIG environment variable
    /// 3. ~/.config/capsync/config.toml
    /// 4. /etc/capsync/config.toml
    /// 5. Default values
    pub fn load(&self) -> ConfigResult<CapsyncConfig> {
        let mut config = match self.find_config_file() {
            Some(path) => {
                info!("Loading configuration from: {}", path.display());
                self.load_from_file(&path)?
            }
            None => {
                debug!("No config file found, using defaults");
                CapsyncConfig::default()
            }
        };

        self.apply_env_overrides(&mut config);
        self.validate(&config)?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.cli_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!("CLI config path does not exist: {}", path.display());
        }

        if let Ok(env_path) = std::env::var("CAPSYNC_CONFIG") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
            warn!("CAPSYNC_CONFIG path does not exist: {}", env_path);
        }

        if let Some(path) = Self::default_config_path() {
            if path.exists() {
                return Some(path);
            }
        }

        #[cfg(unix)]
        {
            let path = PathBuf::from("/etc/capsync/config.toml");
            if path.exists() {
                return Some(path);
            }
        }

        None
    }

    fn load_from_file(&self, path: &Path) -> ConfigResult<CapsyncConfig> {
        let content = std::fs::read_to_string(path)?;
        let config: CapsyncConfig = toml::from_str(&content)?;
        Ok(config)
    }

    fn apply_env_overrides(&self, config: &mut CapsyncConfig) {
        if let Ok(val) = std::env::var("CAPSYNC_LOG_LEVEL") {
            config.general.log_level = val;
        }

        if let Ok(val) = std::env::var("CAPSYNC_WORKER_PATH") {
            config.worker.path = Some(PathBuf::from(val));
        }

        if let Ok(val) = std::env::var("CAPSYNC_MAX_MESSAGE_LEN") {
            match val.parse() {
                Ok(len) => config.sync.max_message_len = len,
                Err(_) => warn!("Ignoring CAPSYNC_MAX_MESSAGE_LEN={}: not a number", val),
            }
        }
    }

    fn validate(&self, config: &CapsyncConfig) -> ConfigResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.general.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                config.general.log_level, valid_levels
            )));
        }

        // The oversize diagnostic needs room for at least a header
        let len = config.sync.max_message_len;
        if !(2 * HEADER_LEN..=MAX_BLOCK_LEN).contains(&len) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid max_message_len: {}. Must be between {} and {}",
                len,
                2 * HEADER_LEN,
                MAX_BLOCK_LEN
            )));
        }

        if config.sync.reap_retries == 0 {
            return Err(ConfigError::ValidationError(
                "reap_retries must be at least 1".to_string(),
            ));
        }

        if config.worker.program_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "Worker program_name cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Save configuration to a file
    pub fn save(&self, config: &CapsyncConfig, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(config).map_err(|e| {
            ConfigError::ValidationError(format!("Failed to serialize config: {}", e))
        })?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Per-user config file location for the current platform
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("capsync").join("config.toml"))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        #[cfg(target_os = "windows")]
        {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        }

        #[cfg(not(target_os = "windows"))]
        {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::InterfaceOptions;

    #[test]
    fn test_default_config() {
        let config = CapsyncConfig::default();
        assert_eq!(config.general.log_level, "info");
        assert_eq!(config.worker.program_name, "dumpcap");
        assert!(config.worker.path.is_none());
        assert_eq!(config.sync.max_message_len, SP_MAX_MSG_LEN);
        assert_eq!(config.sync.stop_timeout(), Duration::from_millis(500));
        assert_eq!(config.sync.reap_retries, 3);
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml_str = r#"
            [general]
            log_level = "debug"
        "#;
        let config: CapsyncConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.sync, SyncSettings::default());
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
            [general]
            log_level = "trace"

            [worker]
            path = "/opt/wireshark/bin/dumpcap"

            [sync]
            max_message_len = 8192
            stop_timeout_ms = 250

            [capture]
            autostop_packets = 100

            [[capture.interfaces]]
            name = "eth0"
            cfilter = "udp"
        "#;

        let config: CapsyncConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.general.log_level, "trace");
        assert_eq!(
            config.worker.path.as_deref(),
            Some(Path::new("/opt/wireshark/bin/dumpcap"))
        );
        assert_eq!(config.worker.program_name, "dumpcap");
        assert_eq!(config.sync.max_message_len, 8192);
        assert_eq!(config.sync.stop_timeout_ms, 250);
        assert_eq!(config.sync.reap_retries, 3);
        assert_eq!(config.capture.autostop_packets, Some(100));
        assert_eq!(config.capture.interfaces[0].cfilter.as_deref(), Some("udp"));
    }

    #[test]
    fn test_validation_invalid_log_level() {
        let config = CapsyncConfig {
            general: GeneralSettings {
                log_level: "loud".to_string(),
            },
            ..Default::default()
        };
        assert!(ConfigLoader::new().validate(&config).is_err());
    }

    #[test]
    fn test_validation_message_len_bounds() {
        let loader = ConfigLoader::new();
        let mut config = CapsyncConfig::default();

        config.sync.max_message_len = 4;
        assert!(loader.validate(&config).is_err());

        config.sync.max_message_len = MAX_BLOCK_LEN + 1;
        assert!(loader.validate(&config).is_err());

        config.sync.max_message_len = MAX_BLOCK_LEN;
        assert!(loader.validate(&config).is_ok());
    }

    #[test]
    fn test_load_from_cli_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capsync.toml");
        std::fs::write(&path, "[sync]\nreap_retries = 5\n").unwrap();

        let config = ConfigLoader::new()
            .with_cli_path(Some(path))
            .load()
            .unwrap();
        assert_eq!(config.sync.reap_retries, 5);
    }

    #[test]
    fn test_load_rejects_bad_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[sync\nreap_retries = ").unwrap();

        let err = ConfigLoader::new()
            .with_cli_path(Some(path))
            .load()
            .unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = CapsyncConfig::default();
        config.worker.path = Some(PathBuf::from("/usr/local/bin/dumpcap"));
        config.capture.interfaces.push(InterfaceOptions::new("wlan0"));

        let loader = ConfigLoader::new();
        loader.save(&config, &path).unwrap();
        let reloaded = loader.load_from_file(&path).unwrap();
        assert_eq!(reloaded, config);
    }
}
