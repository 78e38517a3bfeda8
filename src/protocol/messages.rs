//! Canonical telemetry data model
//!
//! A [`TelemetryBatch`] is the only shape the trapper client accepts. Every
//! constructor validates, so a batch that exists is always sendable: it has a
//! server address with a non-empty host and a non-zero port, a target host
//! name, and at least one item whose value came from a numeric input.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Default Zabbix trapper port
pub const DEFAULT_TRAPPER_PORT: u16 = 10051;

/// Rejections raised before any network activity takes place
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("No items in payload")]
    EmptyItems,
    #[error("Item host name must not be empty")]
    EmptyHostName,
    #[error("Item key must not be empty")]
    EmptyKey,
    #[error("Invalid value type for item: {key}")]
    NonNumericValue { key: String },
    #[error("Invalid Zabbix server address: {0}")]
    InvalidAddress(String),
}

/// Upstream trapper endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, ValidationError> {
        let host = host.into();
        let host = host
            .trim()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .trim();
        if host.is_empty() {
            return Err(ValidationError::InvalidAddress(
                "host must not be empty".to_string(),
            ));
        }
        if port == 0 {
            return Err(ValidationError::InvalidAddress(format!(
                "{host}: port must be a positive integer"
            )));
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// Parse `host:port` or `[v6-addr]:port`
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let input = input.trim();
        let (host, port) = input
            .rsplit_once(':')
            .ok_or_else(|| ValidationError::InvalidAddress(format!("{input}: expected host:port")))?;

        // An unbracketed IPv6 literal has more than one colon and no port we can trust
        if host.contains(':') && !host.starts_with('[') {
            return Err(ValidationError::InvalidAddress(format!(
                "{input}: IPv6 addresses must be bracketed"
            )));
        }

        let port = port
            .parse::<u16>()
            .map_err(|_| ValidationError::InvalidAddress(format!("{input}: invalid port")))?;
        Self::new(host, port)
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// One metric value destined for a trapper item
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TelemetryItem {
    key: String,
    value: String,
}

impl TelemetryItem {
    /// Build an item from a numeric string such as `"21.5"`
    pub fn numeric(key: impl Into<String>, value: &str) -> Result<Self, ValidationError> {
        let key = Self::checked_key(key.into())?;
        let trimmed = value.trim();
        match trimmed.parse::<f64>() {
            Ok(number) if number.is_finite() => Ok(Self {
                key,
                value: trimmed.to_string(),
            }),
            _ => Err(ValidationError::NonNumericValue { key }),
        }
    }

    /// Build an item from a decoded JSON value; only JSON numbers are accepted
    pub fn from_json(key: impl Into<String>, value: &serde_json::Value) -> Result<Self, ValidationError> {
        let key = Self::checked_key(key.into())?;
        match value {
            serde_json::Value::Number(number) => Ok(Self {
                key,
                value: render_number(number),
            }),
            _ => Err(ValidationError::NonNumericValue { key }),
        }
    }

    fn checked_key(key: String) -> Result<String, ValidationError> {
        if key.trim().is_empty() {
            Err(ValidationError::EmptyKey)
        } else {
            Ok(key)
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

/// Integral floats lose their fractional part (`5.0` is sent as `5`)
fn render_number(number: &serde_json::Number) -> String {
    match number.as_f64() {
        Some(f) if number.is_f64() && f.fract() == 0.0 && f.abs() < MAX_EXACT_INTEGER => {
            if f == 0.0 {
                "0".to_string()
            } else {
                format!("{f:.0}")
            }
        }
        _ => number.to_string(),
    }
}

/// Largest magnitude below which every integral f64 prints exactly
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

/// A validated set of items for one host on one trapper server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryBatch {
    server: ServerAddress,
    host_name: String,
    items: Vec<TelemetryItem>,
}

impl TelemetryBatch {
    pub fn new(
        server: ServerAddress,
        host_name: impl Into<String>,
        items: Vec<TelemetryItem>,
    ) -> Result<Self, ValidationError> {
        let host_name = host_name.into();
        if host_name.trim().is_empty() {
            return Err(ValidationError::EmptyHostName);
        }
        if items.is_empty() {
            return Err(ValidationError::EmptyItems);
        }
        Ok(Self {
            server,
            host_name,
            items,
        })
    }

    pub fn server(&self) -> &ServerAddress {
        &self.server
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn items(&self) -> &[TelemetryItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Always false for a constructed batch; kept for API symmetry with `len`
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
