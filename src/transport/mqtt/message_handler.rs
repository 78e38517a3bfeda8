//! Pure routing and filtering of MQTT events

use crate::bridge::InboundPayload;
use bytes::Bytes;
use rumqttc::{Event, Packet, SubscribeReasonCode};
use std::time::{Duration, Instant};
use tracing::debug;

/// Stateless event routing helpers
pub struct MessageHandler;

impl MessageHandler {
    /// Route an event loop notification
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(packet) => match packet {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                },
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    result: Self::validate_subscription(&suback.return_codes),
                },
                Packet::Disconnect => EventRoute::Disconnected,
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Only the configured topic is processed
    pub fn should_process_message(topic: &str, expected_topic: &str) -> bool {
        if topic != expected_topic {
            debug!(topic, expected_topic, "Ignoring message on unexpected topic");
            return false;
        }
        true
    }

    /// Payload text, or `None` when it is blank
    pub fn payload_text(payload: &[u8]) -> Option<String> {
        let text = String::from_utf8_lossy(payload);
        if text.trim().is_empty() {
            None
        } else {
            Some(text.into_owned())
        }
    }

    pub fn parse_payload(text: &str) -> Result<InboundPayload, String> {
        serde_json::from_str::<InboundPayload>(text).map_err(|e| e.to_string())
    }

    /// Any failure code in the SubAck rejects the subscription
    pub fn validate_subscription(return_codes: &[SubscribeReasonCode]) -> Result<(), String> {
        if return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure))
        {
            Err(format!(
                "Subscription failed with return codes: {return_codes:?}"
            ))
        } else {
            Ok(())
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    ConnectionAcknowledged,
    MessageReceived { topic: String, payload: Bytes },
    SubscriptionConfirmed { result: Result<(), String> },
    Disconnected,
    /// PingResp, PubAck and the like
    InfrastructureEvent(String),
    OutgoingEvent,
}

/// Per-subscription rate limiter.
///
/// A message is admitted when strictly more than `period` has passed since
/// the last admitted one; the first message is always admitted.
#[derive(Debug, Clone)]
pub struct DedupWindow {
    period: Duration,
    last_admitted: Option<Instant>,
}

impl DedupWindow {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last_admitted: None,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Check and record in one step
    pub fn try_admit(&mut self, now: Instant) -> bool {
        match self.last_admitted {
            Some(last) if now.saturating_duration_since(last) <= self.period => false,
            _ => {
                self.last_admitted = Some(now);
                true
            }
        }
    }
}
