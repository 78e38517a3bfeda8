//! Pure connection state and configuration for the MQTT subscription
//!
//! Nothing here touches the network: state names, the observable status
//! record, backoff arithmetic and broker option construction.

use crate::config::MqttSection;
use chrono::{DateTime, Utc};
use rumqttc::{MqttOptions, Transport};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const CLIENT_ID_PREFIX: &str = "zbx-np-";
pub const DEFAULT_NODE_ID: &str = "node";
pub const DEFAULT_MQTT_PORT: u16 = 1883;
pub const DEFAULT_MQTTS_PORT: u16 = 8883;
pub const KEEP_ALIVE: Duration = Duration::from_secs(30);
/// Capacity of the request channel between `AsyncClient` and `EventLoop`
pub const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// Lifecycle of the subscription session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Unknown,
    Disabled,
    Starting,
    Connecting,
    Running,
    Reconnecting,
    Disconnected,
    Offline,
    Error,
    Stopped,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Unknown => "unknown",
            ConnectionState::Disabled => "disabled",
            ConnectionState::Starting => "starting",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Running => "running",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Offline => "offline",
            ConnectionState::Error => "error",
            ConnectionState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable status of the subscription, broadcast as `mqtt_status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeStatus {
    pub enabled: bool,
    pub status: ConnectionState,
    pub url: String,
    pub topic: String,
    pub last_updated: DateTime<Utc>,
}

impl Default for BridgeStatus {
    fn default() -> Self {
        Self {
            enabled: false,
            status: ConnectionState::Unknown,
            url: String::new(),
            topic: String::new(),
            last_updated: Utc::now(),
        }
    }
}

impl BridgeStatus {
    /// Status for the given settings in the given state
    pub fn for_settings(config: &MqttSection, status: ConnectionState) -> Self {
        Self {
            enabled: config.enabled,
            status,
            url: config.url.clone(),
            topic: config.topic.clone(),
            last_updated: Utc::now(),
        }
    }
}

/// Reconnection policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Consecutive failures after which the session gives up
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl ReconnectConfig {
    /// `min(base * 2^(attempt-1), max)`, attempts counted from 1
    pub fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Subscription topic must not be empty")]
    EmptyTopic,
    #[error("Subscription rejected by broker: {0}")]
    SubscriptionFailed(String),
    #[error("MQTT client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("Connection failed: {0}")]
    Connection(#[from] rumqttc::ConnectionError),
}

/// Client id derived from the configured node id
pub fn client_id(node_id: &str) -> String {
    let node_id = node_id.trim();
    if node_id.is_empty() {
        format!("{CLIENT_ID_PREFIX}{DEFAULT_NODE_ID}")
    } else {
        format!("{CLIENT_ID_PREFIX}{node_id}")
    }
}

/// Parsed broker endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Accept only `mqtt://` and `mqtts://` URLs with a host
pub fn parse_broker_url(raw: &str) -> Result<BrokerEndpoint, MqttError> {
    let url = Url::parse(raw.trim()).map_err(|e| MqttError::InvalidBrokerUrl(format!("{raw}: {e}")))?;

    let tls = match url.scheme() {
        "mqtt" => false,
        "mqtts" => true,
        other => {
            return Err(MqttError::InvalidBrokerUrl(format!(
                "{raw}: unsupported scheme {other}://"
            )))
        }
    };

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| MqttError::InvalidBrokerUrl(format!("{raw}: missing host")))?
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_string();
    let port = url
        .port()
        .unwrap_or(if tls { DEFAULT_MQTTS_PORT } else { DEFAULT_MQTT_PORT });

    Ok(BrokerEndpoint { host, port, tls })
}

/// Build broker options from the settings.
///
/// Persistent session, 30 s keep-alive, credentials when a login is set, TLS
/// for `mqtts://`.
pub fn configure_mqtt_options(config: &MqttSection) -> Result<MqttOptions, MqttError> {
    let endpoint = parse_broker_url(&config.url)?;
    if config.topic.trim().is_empty() {
        return Err(MqttError::EmptyTopic);
    }

    let mut options = MqttOptions::new(client_id(&config.id), endpoint.host, endpoint.port);
    options.set_keep_alive(KEEP_ALIVE);
    options.set_clean_session(false);

    if !config.login.is_empty() {
        options.set_credentials(config.login.clone(), config.password.clone());
    }

    if endpoint.tls {
        options.set_transport(Transport::tls_with_default_config());
    }

    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(url: &str) -> MqttSection {
        MqttSection {
            enabled: true,
            url: url.to_string(),
            topic: "sensors/data".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_state_names_are_lowercase() {
        assert_eq!(ConnectionState::Running.to_string(), "running");
        assert_eq!(
            serde_json::to_string(&ConnectionState::Reconnecting).unwrap(),
            "\"reconnecting\""
        );
        assert_eq!(ConnectionState::default(), ConnectionState::Unknown);
    }

    #[test]
    fn test_backoff_sequence() {
        let config = ReconnectConfig::default();
        let delays: Vec<u64> = (1..=7)
            .map(|attempt| config.calculate_backoff_delay(attempt).as_secs())
            .collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60, 60]);
        assert_eq!(config.calculate_backoff_delay(u32::MAX).as_secs(), 60);
        assert_eq!(config.calculate_backoff_delay(0).as_secs(), 5);
    }

    #[test]
    fn test_client_id() {
        assert_eq!(client_id(""), "zbx-np-node");
        assert_eq!(client_id("  "), "zbx-np-node");
        assert_eq!(client_id("plant-7"), "zbx-np-plant-7");
    }

    #[test]
    fn test_parse_broker_url_defaults_ports() {
        let plain = parse_broker_url("mqtt://broker.local").unwrap();
        assert_eq!(plain.port, 1883);
        assert!(!plain.tls);

        let secure = parse_broker_url("mqtts://broker.local").unwrap();
        assert_eq!(secure.port, 8883);
        assert!(secure.tls);

        let explicit = parse_broker_url("mqtt://10.0.0.2:1999").unwrap();
        assert_eq!(explicit.host, "10.0.0.2");
        assert_eq!(explicit.port, 1999);
    }

    #[test]
    fn test_parse_broker_url_rejects_other_schemes() {
        assert!(matches!(
            parse_broker_url("http://broker.local"),
            Err(MqttError::InvalidBrokerUrl(_))
        ));
        assert!(parse_broker_url("not a url").is_err());
        assert!(parse_broker_url("").is_err());
    }

    #[test]
    fn test_configure_mqtt_options() {
        let mut config = settings("mqtt://broker.local:1884");
        config.id = "edge".to_string();
        config.login = "bridge".to_string();
        config.password = "pw".to_string();

        let options = configure_mqtt_options(&config).unwrap();
        assert_eq!(options.client_id(), "zbx-np-edge");
        assert_eq!(
            options.broker_address(),
            ("broker.local".to_string(), 1884)
        );
        assert_eq!(options.keep_alive(), KEEP_ALIVE);
        assert!(!options.clean_session());
        assert_eq!(
            options.credentials(),
            Some(("bridge".to_string(), "pw".to_string()))
        );
    }

    #[test]
    fn test_configure_mqtt_options_requires_topic() {
        let mut config = settings("mqtt://broker.local");
        config.topic.clear();
        assert!(matches!(
            configure_mqtt_options(&config),
            Err(MqttError::EmptyTopic)
        ));
    }

    #[test]
    fn test_anonymous_when_login_empty() {
        let options = configure_mqtt_options(&settings("mqtt://broker.local")).unwrap();
        assert_eq!(options.credentials(), None);
    }
}
