//! Single path from an inbound payload to the trapper
//!
//! HTTP requests and admitted MQTT messages both end up in
//! [`BridgeIngester::deliver`], which owns the request counters and the
//! request trace events.

use super::payload::InboundPayload;
use crate::observability::events::{kind, EventHub};
use crate::observability::stats::StatsAggregator;
use crate::protocol::{codec, TelemetryBatch, ValidationError};
use crate::transport::{SendError, TrapperSender};
use chrono::Local;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, Instrument};

/// Where a payload came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Http,
    Mqtt { topic: String },
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Http => f.write_str("HTTP"),
            Source::Mqtt { topic } => write!(f, "MQTT topic {topic}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Invalid payload: {0}")]
    Validation(#[from] ValidationError),
    #[error("Parse Error: {0}")]
    Parse(String),
    #[error(transparent)]
    Send(#[from] SendError),
}

impl IngestError {
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::Validation(_) => "validation_error",
            IngestError::Parse(_) => "parse_error",
            IngestError::Send(e) => e.kind(),
        }
    }
}

/// Successful delivery
#[derive(Debug, Clone, PartialEq)]
pub struct IngestReceipt {
    /// Normalised request as it was sent
    pub request: InboundPayload,
    /// Trapper response with escapes decoded
    pub response: String,
}

pub struct BridgeIngester {
    trapper: Arc<dyn TrapperSender>,
    hub: Arc<EventHub>,
    stats: Arc<StatsAggregator>,
}

impl BridgeIngester {
    pub fn new(
        trapper: Arc<dyn TrapperSender>,
        hub: Arc<EventHub>,
        stats: Arc<StatsAggregator>,
    ) -> Self {
        Self {
            trapper,
            hub,
            stats,
        }
    }

    /// Emit the timestamp and source lines that open a request trace
    pub fn announce(&self, source: &Source) {
        self.hub.emit(
            kind::INFO,
            Local::now().format("[%H:%M:%S %d-%m-%Y]").to_string(),
        );
        self.hub
            .emit(kind::INFO, format!("Received data from {source}"));
    }

    /// Parse a raw JSON body, then ingest it
    pub async fn ingest_raw(&self, source: Source, raw: &[u8]) -> Result<IngestReceipt, IngestError> {
        self.announce(&source);
        let payload = match serde_json::from_slice::<InboundPayload>(raw) {
            Ok(payload) => payload,
            Err(e) => return Err(self.reject(IngestError::Parse(e.to_string()))),
        };
        self.process(payload).await
    }

    /// Ingest an already-decoded payload
    pub async fn ingest(&self, source: Source, payload: InboundPayload) -> Result<IngestReceipt, IngestError> {
        self.announce(&source);
        self.process(payload).await
    }

    /// Handle an admitted MQTT message.
    ///
    /// Parse and validation failures are reported as events and do not touch
    /// the request counters.
    pub async fn ingest_mqtt(&self, topic: &str, text: &str) -> Result<IngestReceipt, IngestError> {
        let span = crate::mqtt_span!(topic = %topic);
        async {
            self.announce(&Source::Mqtt {
                topic: topic.to_string(),
            });
            self.hub.emit(kind::INFO, format!("MQTT: {text}"));

            let prepared = serde_json::from_str::<InboundPayload>(text)
                .map_err(|e| IngestError::Parse(e.to_string()))
                .and_then(|payload| {
                    let normalized = payload.normalize()?;
                    let batch = normalized.to_batch()?;
                    Ok((normalized, batch))
                });

            let (request, batch) = match prepared {
                Ok(prepared) => prepared,
                Err(e) => {
                    self.hub.emit(kind::ERROR, format!("MQTT Error: {e}"));
                    return Err(e);
                }
            };

            self.stats.mqtt_message_accepted();
            self.deliver(request, batch).await
        }
        .instrument(span)
        .await
    }

    async fn process(&self, payload: InboundPayload) -> Result<IngestReceipt, IngestError> {
        let prepared = payload.normalize().and_then(|normalized| {
            let batch = normalized.to_batch()?;
            Ok((normalized, batch))
        });

        match prepared {
            Ok((request, batch)) => self.deliver(request, batch).await,
            Err(e) => Err(self.reject(e.into())),
        }
    }

    /// Count and report an attempt that never reached the trapper
    fn reject(&self, error: IngestError) -> IngestError {
        self.stats.request_received();
        self.stats.request_failed();
        self.hub.emit(
            kind::ERROR,
            format!("Error processing Zabbix request: {error}"),
        );
        error
    }

    /// Send a validated batch and record the outcome
    pub async fn deliver(
        &self,
        request: InboundPayload,
        batch: TelemetryBatch,
    ) -> Result<IngestReceipt, IngestError> {
        self.stats.request_received();

        match serde_json::to_string(&request) {
            Ok(json) => {
                self.hub
                    .emit(kind::ZABBIX_REQUEST, format!("Request JSON: {json}"));
            }
            Err(e) => debug!(error = %e, "Could not render request for trace"),
        }
        self.hub.emit(
            kind::ZABBIX_INFO,
            format!("Zabbix: Sending {} data items to server", batch.len()),
        );

        match self.trapper.send(&batch).await {
            Ok(raw) => {
                let response = codec::decode_unicode_escapes(&raw);
                self.stats.request_succeeded();
                self.hub
                    .emit(kind::ZABBIX_RESULT, format!("Zabbix Result: {response}"));
                Ok(IngestReceipt { request, response })
            }
            Err(e) => {
                self.stats.request_failed();
                self.hub.emit(
                    kind::ERROR,
                    format!(
                        "Error processing Zabbix request: {}",
                        crate::error::sanitize_error_message(&e.to_string())
                    ),
                );
                Err(e.into())
            }
        }
    }
}
