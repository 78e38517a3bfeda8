//! Bridge configuration
//!
//! Settings live in a TOML file with four sections (`http`, `observer`,
//! `trapper`, `mqtt`). Every field has a serde default so a partial or empty
//! file loads. [`ConfigStore`] owns the live copy and writes changes back to
//! disk before applying them.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Environment variable that overrides the configuration path
pub const CONFIG_PATH_ENV: &str = "ZBX_BRIDGE_CONFIG";
/// Configuration path used when neither the CLI nor the environment names one
pub const DEFAULT_CONFIG_PATH: &str = "zbx-bridge.toml";
/// Placeholder shown instead of the stored MQTT password
pub const MASKED_PASSWORD: &str = "***";

/// Complete bridge configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub observer: ObserverSection,
    #[serde(default)]
    pub trapper: TrapperSection,
    #[serde(default)]
    pub mqtt: MqttSection,
}

/// Inbound HTTP API
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpSection {
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            port: default_http_port(),
        }
    }
}

fn default_http_port() -> u16 {
    7000
}

/// Push channel for observers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObserverSection {
    #[serde(default = "default_observer_port")]
    pub port: u16,
}

impl Default for ObserverSection {
    fn default() -> Self {
        Self {
            port: default_observer_port(),
        }
    }
}

fn default_observer_port() -> u16 {
    2794
}

/// Outbound trapper connections
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrapperSection {
    /// Budget for connect, write and read together
    #[serde(default = "default_trapper_timeout_ms")]
    pub timeout_ms: u64,
}

impl TrapperSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for TrapperSection {
    fn default() -> Self {
        Self {
            timeout_ms: default_trapper_timeout_ms(),
        }
    }
}

fn default_trapper_timeout_ms() -> u64 {
    1000
}

/// MQTT subscription settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MqttSection {
    #[serde(default)]
    pub enabled: bool,
    /// `mqtt://host[:port]` or `mqtts://host[:port]`
    #[serde(default)]
    pub url: String,
    /// Node identifier folded into the client id
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub topic: String,
    /// Dedup window in seconds
    #[serde(default = "default_mqtt_period")]
    pub period: u64,
}

fn default_mqtt_period() -> u64 {
    10
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            id: String::new(),
            login: String::new(),
            password: String::new(),
            topic: String::new(),
            period: default_mqtt_period(),
        }
    }
}

impl MqttSection {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period)
    }

    /// Copy with the password replaced by the mask (empty stays empty)
    pub fn masked(&self) -> Self {
        let mut masked = self.clone();
        if !masked.password.is_empty() {
            masked.password = MASKED_PASSWORD.to_string();
        }
        masked
    }

    /// Resolve a submitted update against the stored settings.
    ///
    /// A password equal to the mask means "keep what is stored".
    pub fn merged_with(mut self, stored: &MqttSection) -> Self {
        if self.password == MASKED_PASSWORD {
            self.password = stored.password.clone();
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        let url = url::Url::parse(&self.url)
            .map_err(|e| ConfigError::InvalidConfig(format!("mqtt.url {:?}: {e}", self.url)))?;
        if !matches!(url.scheme(), "mqtt" | "mqtts") {
            return Err(ConfigError::InvalidConfig(format!(
                "mqtt.url must use mqtt:// or mqtts://, got {}://",
                url.scheme()
            )));
        }
        if self.topic.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "mqtt.topic must not be empty when MQTT is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BridgeConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: BridgeConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Write configuration as pretty TOML, creating parent directories
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.http.port == self.observer.port {
            return Err(ConfigError::InvalidConfig(format!(
                "http.port and observer.port must differ (both {})",
                self.http.port
            )));
        }
        if self.trapper.timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "trapper.timeout_ms must be positive".to_string(),
            ));
        }
        self.mqtt.validate()
    }

    /// Copy safe to display or return over the API
    pub fn masked(&self) -> Self {
        Self {
            mqtt: self.mqtt.masked(),
            ..self.clone()
        }
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[http]
port = 17000

[observer]
port = 12794

[trapper]
timeout_ms = 200

[mqtt]
enabled = true
url = "mqtt://localhost:1883"
id = "test"
topic = "sensors/data"
period = 10
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// Resolve the configuration path: explicit argument, then environment, then default
pub fn resolve_config_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit
        .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Live configuration shared by the HTTP layer and the bridge
#[derive(Debug)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    current: RwLock<BridgeConfig>,
}

impl ConfigStore {
    /// Load from `path`, writing defaults there first if the file does not exist
    pub fn load_or_create(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = if path.exists() {
            BridgeConfig::load_from_file(&path)?
        } else {
            info!(path = %path.display(), "Configuration file not found, writing defaults");
            let config = BridgeConfig::default();
            config.save_to_file(&path)?;
            config
        };

        Ok(Self {
            path: Some(path),
            current: RwLock::new(config),
        })
    }

    /// Store that never touches the filesystem
    pub fn in_memory(config: BridgeConfig) -> Self {
        Self {
            path: None,
            current: RwLock::new(config),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self) -> BridgeConfig {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn mqtt(&self) -> MqttSection {
        self.get().mqtt
    }

    /// Write the current configuration to disk
    pub fn persist(&self) -> Result<(), ConfigError> {
        let snapshot = self.get();
        self.write(&snapshot)
    }

    /// Persist new MQTT settings, then apply them in memory.
    ///
    /// Returns whether anything changed. On a write failure the in-memory copy
    /// is left as it was.
    pub fn update_mqtt(&self, mqtt: MqttSection) -> Result<bool, ConfigError> {
        let mut current = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if current.mqtt == mqtt {
            debug!("MQTT settings unchanged");
            return Ok(false);
        }

        let candidate = BridgeConfig {
            mqtt,
            ..current.clone()
        };
        self.write(&candidate)?;
        *current = candidate;
        Ok(true)
    }

    fn write(&self, config: &BridgeConfig) -> Result<(), ConfigError> {
        match &self.path {
            Some(path) => config.save_to_file(path),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let config = BridgeConfig::test_config();
        assert_eq!(config.http.port, 17000);
        assert_eq!(config.observer.port, 12794);
        assert_eq!(config.trapper.timeout(), Duration::from_millis(200));
        assert!(config.mqtt.enabled);
        assert_eq!(config.mqtt.topic, "sensors/data");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: BridgeConfig = toml::from_str("").unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.http.port, 7000);
        assert_eq!(config.observer.port, 2794);
        assert_eq!(config.trapper.timeout_ms, 1000);
        assert!(!config.mqtt.enabled);
        assert_eq!(config.mqtt.period, 10);
    }

    #[test]
    fn test_partial_mqtt_section() {
        let config: BridgeConfig = toml::from_str(
            r#"
[mqtt]
enabled = true
url = "mqtts://broker.local"
topic = "plant/#"
"#,
        )
        .unwrap();

        assert_eq!(config.mqtt.period, 10);
        assert!(config.mqtt.login.is_empty());
        assert_eq!(config.http.port, 7000);
    }

    #[test]
    fn test_mqtt_validation() {
        let mut mqtt = MqttSection {
            enabled: true,
            url: "http://broker".to_string(),
            topic: "t".to_string(),
            ..Default::default()
        };
        assert!(mqtt.validate().is_err());

        mqtt.url = "mqtt://broker".to_string();
        assert!(mqtt.validate().is_ok());

        mqtt.topic = " ".to_string();
        assert!(mqtt.validate().is_err());

        mqtt.enabled = false;
        assert!(mqtt.validate().is_ok(), "disabled settings are not checked");
    }

    #[test]
    fn test_port_clash_rejected() {
        let mut config = BridgeConfig::default();
        config.observer.port = config.http.port;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_masking_and_merge() {
        let stored = MqttSection {
            password: "s3cret".to_string(),
            ..Default::default()
        };
        assert_eq!(stored.masked().password, MASKED_PASSWORD);
        assert_eq!(MqttSection::default().masked().password, "");

        let update = MqttSection {
            password: MASKED_PASSWORD.to_string(),
            topic: "new/topic".to_string(),
            ..Default::default()
        };
        let merged = update.merged_with(&stored);
        assert_eq!(merged.password, "s3cret");
        assert_eq!(merged.topic, "new/topic");

        let replaced = MqttSection {
            password: "other".to_string(),
            ..Default::default()
        }
        .merged_with(&stored);
        assert_eq!(replaced.password, "other");
    }

    #[test]
    fn test_in_memory_update_reports_changes() {
        let store = ConfigStore::in_memory(BridgeConfig::default());
        assert!(!store.update_mqtt(MqttSection::default()).unwrap());

        let update = MqttSection {
            period: 30,
            ..Default::default()
        };
        assert!(store.update_mqtt(update).unwrap());
        assert_eq!(store.mqtt().period, 30);
    }

    #[test]
    fn test_resolve_config_path_prefers_explicit() {
        let path = resolve_config_path(Some(PathBuf::from("/tmp/explicit.toml")));
        assert_eq!(path, PathBuf::from("/tmp/explicit.toml"));
    }
}
