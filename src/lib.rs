//! zbx-bridge
//!
//! Bridges telemetry arriving over HTTP or MQTT into the Zabbix sender
//! protocol and pushes live status to attached observers.
//!
//! # Overview
//!
//! - [`protocol`] - the `ZBXD` frame codec and the validated batch model
//! - [`transport`] - the one-shot trapper client and the MQTT subscription
//! - [`bridge`] - payload normalisation, ingestion and the [`Bridge`] context
//! - [`observability`] - logging, the event hub, counters and the push channel
//! - [`api`] - the inbound HTTP routes
//! - [`config`] - TOML configuration and the live [`ConfigStore`]
//!
//! # Quick Start
//!
//! ```rust
//! use zbx_bridge::protocol::{codec, ServerAddress, TelemetryBatch, TelemetryItem};
//!
//! let batch = TelemetryBatch::new(
//!     ServerAddress::parse("127.0.0.1:10051").unwrap(),
//!     "sensor1",
//!     vec![TelemetryItem::numeric("temp", "21.5").unwrap()],
//! )
//! .unwrap();
//!
//! let packet = codec::encode(&batch).unwrap();
//! assert_eq!(&packet[..4], b"ZBXD");
//! ```

pub mod api;
pub mod bridge;
pub mod config;
pub mod error;
pub mod observability;
pub mod protocol;
pub mod testing;
pub mod transport;

pub use bridge::{Bridge, BridgeIngester, InboundPayload, Source};
pub use config::{BridgeConfig, ConfigStore};
pub use error::{BridgeError, BridgeResult};
pub use observability::{EventHub, StatsAggregator};
pub use transport::{TrapperClient, TrapperSender};
