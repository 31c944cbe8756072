//! Device configuration
//!
//! Configuration is loaded from YAML. Search order:
//!
//! 1. Path specified via `CEDEV_CONFIG` environment variable
//! 2. `./cedev.yaml` in the current directory
//! 3. `~/.config/cedev/config.yaml` (platform config directory)
//! 4. `/etc/cedev/config.yaml`
//!
//! When no file is found the defaults are used.
//!
//! ```yaml
//! queue:
//!   wait_timeout_ms: 1500
//! transfer:
//!   max_oper_data: 32768
//!   max_offload_transfer: 4194304
//! sim:
//!   latency_us: 0
//!   support:
//!     sha_hmac: false
//!     aes_xts: true
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::CeSupport;

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "CEDEV_CONFIG";

/// Every transfer limit is a multiple of this (covers the cipher blocks,
/// the hash block, the cache line and the XTS data unit)
pub const TRANSFER_ALIGN: usize = 512;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read configuration file
    #[error("failed to read config: {0}")]
    ReadError(String),

    /// Failed to parse configuration
    #[error("failed to parse config: {0}")]
    ParseError(String),

    /// Invalid configuration value
    #[error("invalid config: {0}")]
    ValidationError(String),
}

/// Top-level device configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CeConfig {
    /// Request queue settings
    pub queue: QueueConfig,

    /// Transfer size limits
    pub transfer: TransferConfig,

    /// Simulated engine settings
    pub sim: SimConfig,
}

/// Request queue settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Bounded wait for one engine job, in milliseconds
    pub wait_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { wait_timeout_ms: 1500 }
    }
}

/// Transfer size limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Largest contiguous chunk for one cipher or hash job
    pub max_oper_data: usize,

    /// Largest mapped piece for one offload job
    pub max_offload_transfer: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_oper_data: 32 * 1024,
            max_offload_transfer: 128 * 32 * 1024,
        }
    }
}

/// Simulated engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Artificial execution latency per job, in microseconds
    pub latency_us: u64,

    /// Capabilities the simulated engine reports
    pub support: CeSupport,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            latency_us: 0,
            support: CeSupport {
                sha_hmac: false,
                aes_xts: true,
                aes_key_192: true,
                cmac: true,
                hw_key: true,
            },
        }
    }
}

impl CeConfig {
    /// Load configuration from the standard search paths
    pub fn load() -> Result<Self, ConfigError> {
        // Check environment variable first
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            if Path::new(&path).exists() {
                return Self::load_from(Path::new(&path));
            }
            tracing::warn!("{} points at missing file {}", CONFIG_ENV, path);
        }

        for path in &Self::config_search_paths() {
            if path.exists() {
                return Self::load_from(path);
            }
        }

        Ok(Self::default())
    }

    /// Load and validate a specific file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        let config = Self::parse(&content)?;
        config.validate()?;
        tracing::debug!("loaded config from {}", path.display());
        Ok(config)
    }

    /// Parse configuration from a YAML string
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to a YAML file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let yaml =
            serde_yaml::to_string(self).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        std::fs::write(path, yaml)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))
    }

    /// Candidate config file locations, most specific first
    pub fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("cedev.yaml")];

        if let Some(config_dir) = directories::ProjectDirs::from("", "", "cedev") {
            paths.push(config_dir.config_dir().join("config.yaml"));
        }

        paths.push(PathBuf::from("/etc/cedev/config.yaml"));
        paths
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.wait_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "queue.wait_timeout_ms must be positive".to_string(),
            ));
        }

        let max = self.transfer.max_oper_data;
        if max == 0 || max % TRANSFER_ALIGN != 0 {
            return Err(ConfigError::ValidationError(format!(
                "transfer.max_oper_data must be a positive multiple of {}, got {}",
                TRANSFER_ALIGN, max
            )));
        }
        if max > u32::MAX as usize {
            return Err(ConfigError::ValidationError(format!(
                "transfer.max_oper_data {} exceeds 32 bits",
                max
            )));
        }

        let off = self.transfer.max_offload_transfer;
        if off == 0 || off % TRANSFER_ALIGN != 0 {
            return Err(ConfigError::ValidationError(format!(
                "transfer.max_offload_transfer must be a positive multiple of {}, got {}",
                TRANSFER_ALIGN, off
            )));
        }

        Ok(())
    }

    /// Bounded wait as a `Duration`
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.queue.wait_timeout_ms)
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.queue.wait_timeout_ms = timeout.as_millis().max(1) as u64;
        self
    }

    pub fn with_max_oper_data(mut self, max: usize) -> Self {
        self.transfer.max_oper_data = max;
        self
    }

    pub fn with_max_offload_transfer(mut self, max: usize) -> Self {
        self.transfer.max_offload_transfer = max;
        self
    }

    pub fn with_sim_support(mut self, support: CeSupport) -> Self {
        self.sim.support = support;
        self
    }

    /// Generate an example configuration file
    pub fn example_yaml() -> String {
        r#"# cedev configuration

queue:
  # Bounded wait for one engine job before timeout recovery
  wait_timeout_ms: 1500

transfer:
  # Hardware limit for one cipher/hash job (multiple of 512)
  max_oper_data: 32768
  # Largest mapped piece for one offload job
  max_offload_transfer: 4194304

sim:
  latency_us: 0
  support:
    sha_hmac: false
    aes_xts: true
    aes_key_192: true
    cmac: true
    hw_key: true
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CeConfig::default();
        assert_eq!(config.queue.wait_timeout_ms, 1500);
        assert_eq!(config.transfer.max_oper_data, 32768);
        assert_eq!(config.transfer.max_offload_transfer, 4 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_yaml() {
        let config = CeConfig::parse("queue:\n  wait_timeout_ms: 200\n").unwrap();
        assert_eq!(config.queue.wait_timeout_ms, 200);
        assert_eq!(config.transfer.max_oper_data, 32768);
        assert!(config.sim.support.aes_xts);
    }

    #[test]
    fn test_validation() {
        let config = CeConfig::default().with_max_oper_data(1000);
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));

        let mut config = CeConfig::default();
        config.queue.wait_timeout_ms = 0;
        assert!(config.validate().is_err());

        let config = CeConfig::default().with_max_offload_transfer(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_example_yaml() {
        let config = CeConfig::parse(&CeConfig::example_yaml()).unwrap();
        assert_eq!(config, CeConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("cedev-test-{}.yaml", std::process::id()));
        let config = CeConfig::default().with_wait_timeout(Duration::from_millis(250));
        config.save(&path).unwrap();
        let loaded = CeConfig::load_from(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded.wait_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(CeConfig::parse("queue: [1, 2"), Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_config_search_paths() {
        let paths = CeConfig::config_search_paths();
        assert_eq!(paths.first(), Some(&PathBuf::from("cedev.yaml")));
        assert_eq!(paths.last(), Some(&PathBuf::from("/etc/cedev/config.yaml")));
    }
}
