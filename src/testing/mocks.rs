//! Mock implementations for testing
//!
//! [`MockTrapper`] stands in for the trapper client so the ingester, the
//! subscription manager and the HTTP layer can be exercised without a Zabbix
//! server.

use crate::protocol::{codec, TelemetryBatch};
use crate::transport::{SendError, TrapperSender};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

pub const DEFAULT_MOCK_RESPONSE: &str =
    r#"{"response":"success","info":"processed: 1; failed: 0; total: 1; seconds spent: 0.000055"}"#;

/// What the mock does with the next send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOutcome {
    Respond(String),
    Timeout,
    Refuse,
    InvalidAddress,
}

/// Scripted trapper that records every batch it is given
#[derive(Debug)]
pub struct MockTrapper {
    scripted: Mutex<VecDeque<MockOutcome>>,
    fallback: MockOutcome,
    delay: Option<Duration>,
    sent: Mutex<Vec<TelemetryBatch>>,
}

impl Default for MockTrapper {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTrapper {
    /// Answers every send with a success response
    pub fn new() -> Self {
        Self::with_outcome(MockOutcome::Respond(DEFAULT_MOCK_RESPONSE.to_string()))
    }

    /// Answers every send with `outcome`
    pub fn with_outcome(outcome: MockOutcome) -> Self {
        Self {
            scripted: Mutex::new(VecDeque::new()),
            fallback: outcome,
            delay: None,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Wait before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue an outcome for the next send; the fallback applies once the queue is empty
    pub fn push_outcome(&self, outcome: MockOutcome) {
        self.scripted
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(outcome);
    }

    pub fn sent(&self) -> Vec<TelemetryBatch> {
        self.sent.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Request bodies exactly as they would go on the wire
    pub fn sent_bodies(&self) -> Vec<String> {
        self.sent()
            .iter()
            .filter_map(|batch| codec::encode_body(batch).ok())
            .collect()
    }

    fn next_outcome(&self) -> MockOutcome {
        self.scripted
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl TrapperSender for MockTrapper {
    async fn send(&self, batch: &TelemetryBatch) -> Result<String, SendError> {
        self.sent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(batch.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        match self.next_outcome() {
            MockOutcome::Respond(text) => Ok(text),
            MockOutcome::Timeout => Err(SendError::Timeout(1000)),
            MockOutcome::Refuse => Err(SendError::Network(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            ))),
            MockOutcome::InvalidAddress => Err(SendError::InvalidAddress(batch.server().to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ServerAddress, TelemetryItem};

    fn batch() -> TelemetryBatch {
        TelemetryBatch::new(
            ServerAddress::new("zbx", 10051).unwrap(),
            "h",
            vec![TelemetryItem::numeric("k", "1").unwrap()],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_scripted_outcomes_then_fallback() {
        let mock = MockTrapper::new();
        mock.push_outcome(MockOutcome::Refuse);

        assert!(matches!(mock.send(&batch()).await, Err(SendError::Network(_))));
        assert_eq!(mock.send(&batch()).await.unwrap(), DEFAULT_MOCK_RESPONSE);
        assert_eq!(mock.sent().len(), 2);
        assert!(mock.sent_bodies()[0].contains(r#""key":"k""#));
    }
}
