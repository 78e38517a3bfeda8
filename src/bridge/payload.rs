//! Inbound payload shape and normalisation
//!
//! Producers send either a combined `zabbix_server: "host:port"` or the older
//! `zabbix_server_ip` + `zabbix_server_port` pair. Both are folded into the
//! combined form here, before anything else looks at the payload.

use crate::protocol::{
    ServerAddress, TelemetryBatch, TelemetryItem, ValidationError, DEFAULT_TRAPPER_PORT,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Decoded request body as received from HTTP or MQTT
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InboundPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zabbix_server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zabbix_server_ip: Option<String>,
    /// Number or numeric string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zabbix_server_port: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_host_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<Vec<InboundItem>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InboundItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default)]
    pub value: Value,
}

impl InboundItem {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: Some(key.into()),
            value,
        }
    }
}

fn port_from_value(value: &Value) -> Result<u16, ValidationError> {
    let port = match value {
        Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Value::String(s) => s.trim().parse::<u16>().ok(),
        _ => None,
    };
    port.filter(|p| *p > 0)
        .ok_or_else(|| ValidationError::InvalidAddress(format!("invalid zabbix_server_port {value}")))
}

impl InboundPayload {
    /// Fold the split address fields into `zabbix_server`.
    ///
    /// A payload that already carries `zabbix_server` keeps it and drops the
    /// split fields. The port defaults to 10051.
    pub fn normalize(mut self) -> Result<Self, ValidationError> {
        let has_combined = self
            .zabbix_server
            .as_deref()
            .is_some_and(|s| !s.trim().is_empty());

        if !has_combined {
            let ip = self
                .zabbix_server_ip
                .as_deref()
                .map(str::trim)
                .filter(|ip| !ip.is_empty())
                .ok_or(ValidationError::MissingField("zabbix_server"))?;
            let port = match &self.zabbix_server_port {
                Some(value) => port_from_value(value)?,
                None => DEFAULT_TRAPPER_PORT,
            };
            self.zabbix_server = Some(ServerAddress::new(ip, port)?.to_string());
        }

        self.zabbix_server_ip = None;
        self.zabbix_server_port = None;
        Ok(self)
    }

    /// Normalise and validate into a sendable batch
    pub fn to_batch(&self) -> Result<TelemetryBatch, ValidationError> {
        let normalized = self.clone().normalize()?;
        let server = ServerAddress::parse(normalized.zabbix_server.as_deref().unwrap_or_default())?;

        let host_name = normalized
            .item_host_name
            .as_deref()
            .ok_or(ValidationError::MissingField("item_host_name"))?;

        let raw_items = normalized.item.as_deref().unwrap_or_default();
        let items = raw_items
            .iter()
            .map(|item| {
                let key = item
                    .key
                    .as_deref()
                    .ok_or(ValidationError::MissingField("item.key"))?;
                TelemetryItem::from_json(key, &item.value)
            })
            .collect::<Result<Vec<_>, _>>()?;

        TelemetryBatch::new(server, host_name, items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(value: Value) -> InboundPayload {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_split_address_normalized() {
        let payload = parse(json!({
            "zabbix_server_ip": "10.0.0.5",
            "item_host_name": "h",
            "item": [{"key": "k", "value": 1}]
        }));

        let normalized = payload.normalize().unwrap();
        assert_eq!(normalized.zabbix_server.as_deref(), Some("10.0.0.5:10051"));
        assert!(normalized.zabbix_server_ip.is_none());
        assert!(normalized.zabbix_server_port.is_none());

        let serialized = serde_json::to_value(&normalized).unwrap();
        assert!(serialized.get("zabbix_server_ip").is_none());
    }

    #[test]
    fn test_split_address_with_port_as_number_or_string() {
        for port in [json!(10052), json!("10052")] {
            let payload = parse(json!({
                "zabbix_server_ip": "zbx",
                "zabbix_server_port": port,
                "item_host_name": "h",
                "item": [{"key": "k", "value": 1}]
            }));
            let batch = payload.to_batch().unwrap();
            assert_eq!(batch.server().port, 10052);
        }
    }

    #[test]
    fn test_combined_address_wins() {
        let payload = parse(json!({
            "zabbix_server": "primary:10051",
            "zabbix_server_ip": "ignored",
            "item_host_name": "h",
            "item": [{"key": "k", "value": 1}]
        }));
        let batch = payload.to_batch().unwrap();
        assert_eq!(batch.server().host, "primary");
    }

    #[test]
    fn test_missing_fields() {
        let no_server = parse(json!({"item_host_name": "h", "item": [{"key": "k", "value": 1}]}));
        assert_eq!(
            no_server.to_batch(),
            Err(ValidationError::MissingField("zabbix_server"))
        );

        let no_host = parse(json!({"zabbix_server": "z:1", "item": [{"key": "k", "value": 1}]}));
        assert_eq!(
            no_host.to_batch(),
            Err(ValidationError::MissingField("item_host_name"))
        );

        let no_items = parse(json!({"zabbix_server": "z:1", "item_host_name": "h"}));
        assert_eq!(no_items.to_batch(), Err(ValidationError::EmptyItems));

        let empty_items = parse(json!({"zabbix_server": "z:1", "item_host_name": "h", "item": []}));
        assert_eq!(empty_items.to_batch(), Err(ValidationError::EmptyItems));
    }

    #[test]
    fn test_non_numeric_value_rejected() {
        let payload = parse(json!({
            "zabbix_server": "z:10051",
            "item_host_name": "h",
            "item": [{"key": "ok", "value": 1}, {"key": "bad", "value": "warm"}]
        }));
        assert_eq!(
            payload.to_batch(),
            Err(ValidationError::NonNumericValue {
                key: "bad".to_string()
            })
        );
    }

    #[test]
    fn test_invalid_port_rejected() {
        for port in [json!(0), json!(70000), json!("abc"), json!(true)] {
            let payload = parse(json!({
                "zabbix_server_ip": "zbx",
                "zabbix_server_port": port,
                "item_host_name": "h",
                "item": [{"key": "k", "value": 1}]
            }));
            assert!(matches!(
                payload.to_batch(),
                Err(ValidationError::InvalidAddress(_))
            ));
        }
    }
}
