//! MQTT subscription side of the bridge
//!
//! Pure decisions are kept apart from the I/O so they can be tested without a
//! broker:
//!
//! - [`connection`] - status types, settings validation and client options
//! - [`message_handler`] - event routing, payload checks and the dedup window
//! - [`health_monitor`] - reconnection decisions and state transitions
//! - [`client`] - the [`SubscriptionManager`] that owns the session task
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use zbx_bridge::bridge::BridgeIngester;
//! use zbx_bridge::config::MqttSection;
//! use zbx_bridge::observability::{EventHub, StatsAggregator};
//! use zbx_bridge::transport::{mqtt::SubscriptionManager, TrapperClient};
//!
//! # tokio_test::block_on(async {
//! let hub = Arc::new(EventHub::new());
//! let stats = Arc::new(StatsAggregator::new(hub.clone()));
//! let ingester = Arc::new(BridgeIngester::new(
//!     Arc::new(TrapperClient::default()),
//!     hub.clone(),
//!     stats,
//! ));
//!
//! let settings = MqttSection {
//!     enabled: true,
//!     url: "mqtt://localhost:1883".to_string(),
//!     topic: "sensors/data".to_string(),
//!     ..Default::default()
//! };
//!
//! let mut manager = SubscriptionManager::new(hub, ingester);
//! manager.start(&settings).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::{StatusReporter, SubscriptionManager, SETTLE_DELAY};
pub use connection::{
    client_id, configure_mqtt_options, parse_broker_url, BridgeStatus, BrokerEndpoint,
    ConnectionState, MqttError, ReconnectConfig,
};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use message_handler::{DedupWindow, EventRoute, MessageHandler};
