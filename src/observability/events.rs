//! Event hub: bounded event log plus fan-out to attached observers
//!
//! Records are kept newest-first, capped at [`EVENT_BUFFER_CAPACITY`]. Delivery
//! goes through a `tokio::sync::broadcast` channel so emitters never wait on a
//! slow observer; an observer that falls behind loses its oldest frames and
//! keeps going.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const EVENT_BUFFER_CAPACITY: usize = 100;
pub const REPLAY_WINDOW: usize = 50;
pub const MAX_CONTENT_CHARS: usize = 2000;
const OBSERVER_QUEUE_DEPTH: usize = 256;

/// Event kinds used across the bridge
pub mod kind {
    pub const INFO: &str = "info";
    pub const ERROR: &str = "error";
    pub const ZABBIX_REQUEST: &str = "zabbix-request";
    pub const ZABBIX_INFO: &str = "zabbix-info";
    pub const ZABBIX_RESULT: &str = "zabbix-result";
    pub const MQTT_STATUS: &str = "mqtt_status";
    pub const STATS: &str = "stats";
}

/// One stored event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
    pub timestamp: String,
}

impl EventRecord {
    fn new(kind: &str, content: String) -> Self {
        Self {
            kind: kind.to_string(),
            content,
            timestamp: now_rfc3339(),
        }
    }
}

/// Structured message broadcast to observers but never stored
#[derive(Debug, Serialize)]
struct TypedMessage<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: &'a str,
    data: &'a T,
    timestamp: String,
}

fn now_rfc3339() -> String {
    let now: DateTime<Utc> = Utc::now();
    now.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Keep printable characters plus tab, newline and carriage return, then cap the length
pub fn sanitize_content(content: &str) -> String {
    content
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\t' | '\n' | '\r'))
        .take(MAX_CONTENT_CHARS)
        .collect()
}

/// Identity of an attached observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(Uuid);

impl ObserverId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ObserverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone)]
struct Delivery {
    origin: Option<ObserverId>,
    frame: Arc<str>,
}

#[derive(Debug)]
struct StoredEvent {
    record: EventRecord,
    frame: Arc<str>,
}

/// A live subscription to the hub
#[derive(Debug)]
pub struct Observer {
    id: ObserverId,
    replay: Vec<Arc<str>>,
    receiver: broadcast::Receiver<Delivery>,
}

impl Observer {
    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Frames captured at attach time, oldest first
    pub fn take_replay(&mut self) -> Vec<Arc<str>> {
        std::mem::take(&mut self.replay)
    }

    /// Next frame for this observer; `None` once the hub is gone
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        loop {
            match self.receiver.recv().await {
                Ok(delivery) if delivery.origin == Some(self.id) => continue,
                Ok(delivery) => return Some(delivery.frame),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(observer = %self.id, skipped, "Observer lagging, dropped frames");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Bounded event log with observer fan-out
#[derive(Debug)]
pub struct EventHub {
    records: Mutex<VecDeque<StoredEvent>>,
    sender: broadcast::Sender<Delivery>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(OBSERVER_QUEUE_DEPTH);
        Self {
            records: Mutex::new(VecDeque::with_capacity(EVENT_BUFFER_CAPACITY)),
            sender,
        }
    }

    fn lock_records(&self) -> MutexGuard<'_, VecDeque<StoredEvent>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store and broadcast an event; empty content is dropped
    pub fn emit(&self, kind: &str, content: impl AsRef<str>) -> Option<EventRecord> {
        let content = sanitize_content(content.as_ref());
        if content.trim().is_empty() {
            return None;
        }

        let record = EventRecord::new(kind, content);
        let frame: Arc<str> = match serde_json::to_string(&record) {
            Ok(frame) => frame.into(),
            Err(e) => {
                warn!(error = %e, "Failed to serialize event");
                return None;
            }
        };

        if kind == self::kind::ERROR {
            warn!(target: "zbx_bridge::events", kind, "{}", record.content);
        } else {
            info!(target: "zbx_bridge::events", kind, "{}", record.content);
        }

        let mut records = self.lock_records();
        records.push_front(StoredEvent {
            record: record.clone(),
            frame: frame.clone(),
        });
        records.truncate(EVENT_BUFFER_CAPACITY);
        // Err only means nobody is attached
        let _ = self.sender.send(Delivery {
            origin: None,
            frame,
        });

        Some(record)
    }

    /// Serialize a typed message envelope
    pub fn typed_frame<T: Serialize>(&self, kind: &str, data: &T) -> Option<Arc<str>> {
        let message = TypedMessage {
            kind,
            data,
            timestamp: now_rfc3339(),
        };
        match serde_json::to_string(&message) {
            Ok(frame) => Some(frame.into()),
            Err(e) => {
                warn!(kind, error = %e, "Failed to serialize typed message");
                None
            }
        }
    }

    /// Broadcast a typed message to every observer without storing it
    pub fn broadcast_typed<T: Serialize>(&self, kind: &str, data: &T) {
        let Some(frame) = self.typed_frame(kind, data) else {
            return;
        };
        let _records = self.lock_records();
        let _ = self.sender.send(Delivery {
            origin: None,
            frame,
        });
    }

    /// Forward an observer's text to every other observer
    pub fn relay(&self, origin: ObserverId, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        debug!(observer = %origin, "Relaying observer message");
        let _ = self.sender.send(Delivery {
            origin: Some(origin),
            frame: Arc::from(text),
        });
    }

    /// Register an observer.
    ///
    /// The replay snapshot and the live subscription are taken under the same
    /// lock, so an event lands either in the replay or in the live stream.
    pub fn attach(&self) -> Observer {
        let records = self.lock_records();
        let replay = Self::replay_from(&records);
        let receiver = self.sender.subscribe();
        drop(records);

        let id = ObserverId::new();
        debug!(observer = %id, replayed = replay.len(), "Observer attached");
        Observer {
            id,
            replay,
            receiver,
        }
    }

    /// Up to the last 50 stored events as frames, oldest first
    pub fn replay_last(&self) -> Vec<Arc<str>> {
        Self::replay_from(&self.lock_records())
    }

    fn replay_from(records: &VecDeque<StoredEvent>) -> Vec<Arc<str>> {
        let mut replay: Vec<Arc<str>> = records
            .iter()
            .take(REPLAY_WINDOW)
            .map(|stored| stored.frame.clone())
            .collect();
        replay.reverse();
        replay
    }

    /// Stored events, newest first
    pub fn records(&self) -> Vec<EventRecord> {
        self.lock_records()
            .iter()
            .map(|stored| stored.record.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.lock_records().clear();
        info!("Event log cleared");
    }

    pub fn len(&self) -> usize {
        self.lock_records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_records().is_empty()
    }

    pub fn observer_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
