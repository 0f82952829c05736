//! Configuration for the indriya daemon
//!
//! Loads configuration from a TOML file with the minimal parameters needed
//! for IPC endpoint setup and HAL selection.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Top-level daemon configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub ipc: IpcConfig,
    pub hal: HalConfig,
    pub logging: LoggingConfig,
}

/// IPC endpoint configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IpcConfig {
    /// Well-known Unix domain socket path clients connect to
    pub socket_path: String,

    /// Receive timeout for synchronous channel reads, in milliseconds
    #[serde(default = "default_recv_timeout_ms")]
    pub recv_timeout_ms: u64,
}

fn default_recv_timeout_ms() -> u64 {
    1000
}

/// Hardware abstraction configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HalConfig {
    /// HAL driver selector. Only "mock" ships in-tree; real device modules
    /// live outside this crate and register through the registry API.
    pub driver: String,

    /// Sampling interval the mock devices report as their minimum (ms)
    #[serde(default = "default_mock_min_interval_ms")]
    pub mock_min_interval_ms: i32,
}

fn default_mock_min_interval_ms() -> i32 {
    10
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Default configuration: mock HAL, system socket path
    pub fn defaults() -> Self {
        Self {
            ipc: IpcConfig {
                socket_path: "/run/indriya/command.sock".to_string(),
                recv_timeout_ms: default_recv_timeout_ms(),
            },
            hal: HalConfig {
                driver: "mock".to_string(),
                mock_min_interval_ms: default_mock_min_interval_ms(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::defaults();
        assert_eq!(config.ipc.socket_path, "/run/indriya/command.sock");
        assert_eq!(config.ipc.recv_timeout_ms, 1000);
        assert_eq!(config.hal.driver, "mock");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_serialization() {
        let config = AppConfig::defaults();
        let toml_string = toml::to_string_pretty(&config).unwrap();

        assert!(toml_string.contains("[ipc]"));
        assert!(toml_string.contains("[hal]"));
        assert!(toml_string.contains("[logging]"));
        assert!(toml_string.contains("socket_path = \"/run/indriya/command.sock\""));
    }

    #[test]
    fn test_toml_deserialization() {
        let toml_content = r#"
[ipc]
socket_path = "/tmp/indriya-test.sock"

[hal]
driver = "mock"

[logging]
level = "debug"
"#;

        let config: AppConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.ipc.socket_path, "/tmp/indriya-test.sock");
        // omitted fields fall back to serde defaults
        assert_eq!(config.ipc.recv_timeout_ms, 1000);
        assert_eq!(config.hal.mock_min_interval_ms, 10);
        assert_eq!(config.logging.level, "debug");
    }
}
