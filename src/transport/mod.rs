//! Transport layer
//!
//! Outbound delivery to the Zabbix trapper and the inbound MQTT subscription.

use crate::protocol::TelemetryBatch;

pub mod mqtt;
pub mod trapper;

pub use trapper::{SendError, TrapperClient};

/// Delivery of one batch to the trapper
///
/// Abstracts the network exchange so the ingester can be driven by a mock in
/// tests.
#[async_trait::async_trait]
pub trait TrapperSender: Send + Sync {
    /// Send the batch and return the response text with the protocol header stripped
    async fn send(&self, batch: &TelemetryBatch) -> Result<String, SendError>;
}
