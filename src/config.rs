//! Application-level settings: ports, timeouts, and the inventory file
//! path. All fields are optional in the TOML file and fall back to the
//! defaults below, since a freshly-installed deployment may have nothing
//! but a device inventory.

use serde::Deserialize;
use std::fmt;
use std::time::Duration;

const DEFAULT_DISCOVERY_PORT: u16 = 6667;
const DEFAULT_DEVICE_PORT: u16 = 6668;
const DEFAULT_RECONNECT_MS: u64 = 3000;
const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 3000;
const DEFAULT_INVENTORY_PATH: &str = "tinytuya/devices.json";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub discovery_port: u16,
    pub device_port: u16,
    pub reconnect_ms: u64,
    pub command_timeout_ms: u64,
    pub inventory_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            discovery_port: DEFAULT_DISCOVERY_PORT,
            device_port: DEFAULT_DEVICE_PORT,
            reconnect_ms: DEFAULT_RECONNECT_MS,
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            inventory_path: DEFAULT_INVENTORY_PATH.to_string(),
        }
    }
}

impl Config {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    FileNotFound(String),
    ParseError(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileNotFound(path) => write!(f, "Config file not found: {path}"),
            ConfigError::ParseError(msg) => write!(f, "Failed to parse config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Load settings from `path`. A missing file is not an error here — the
/// caller gets defaults — since the only required artifact to run this
/// crate is the device inventory, not this file.
pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
        Err(_) => Err(ConfigError::FileNotFound(path.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = load_config("/nonexistent/path/tuya-reactor.toml").unwrap();
        assert_eq!(config.discovery_port, DEFAULT_DISCOVERY_PORT);
        assert_eq!(config.device_port, DEFAULT_DEVICE_PORT);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: Config = toml::from_str("reconnect_ms = 500").unwrap();
        assert_eq!(config.reconnect_ms, 500);
        assert_eq!(config.device_port, DEFAULT_DEVICE_PORT);
    }
}
