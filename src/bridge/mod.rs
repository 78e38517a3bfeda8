//! Ingestion path and the bridge context
//!
//! - [`payload`] - inbound JSON shape and address normalisation
//! - [`ingester`] - validation, delivery and request accounting
//! - [`lifecycle`] - the [`Bridge`] that owns the shared state

pub mod ingester;
pub mod lifecycle;
pub mod payload;

pub use ingester::{BridgeIngester, IngestError, IngestReceipt, Source};
pub use lifecycle::{Bridge, SettingsUpdate};
pub use payload::{InboundItem, InboundPayload};
