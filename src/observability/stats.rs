//! Traffic counters and uptime
//!
//! Counters are plain atomics. Every mutation broadcasts a fresh snapshot to
//! observers through the event hub; a 1 Hz ticker keeps `uptime` moving when
//! nothing else happens.

use super::events::{kind, EventHub};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

pub const UPTIME_TICK: Duration = Duration::from_secs(1);

/// Point-in-time view of the counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub mqtt_messages: u64,
    pub zabbix_sends: u64,
    pub connected_clients: u64,
    pub uptime: String,
}

/// Render a duration as `1d 2h 3m 4s`, omitting leading zero units
pub fn format_uptime(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;

    if days > 0 {
        format!("{days}d {hours}h {minutes}m {seconds}s")
    } else if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

pub struct StatsAggregator {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    mqtt_messages: AtomicU64,
    zabbix_sends: AtomicU64,
    connected_clients: AtomicU64,
    started_at: Instant,
    hub: Arc<EventHub>,
}

impl StatsAggregator {
    pub fn new(hub: Arc<EventHub>) -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            successful_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            mqtt_messages: AtomicU64::new(0),
            zabbix_sends: AtomicU64::new(0),
            connected_clients: AtomicU64::new(0),
            started_at: Instant::now(),
            hub,
        }
    }

    /// An inbound attempt arrived, from either source
    pub fn request_received(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.broadcast();
    }

    /// The trapper answered; counts both the request and the send
    pub fn request_succeeded(&self) {
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
        self.zabbix_sends.fetch_add(1, Ordering::Relaxed);
        self.broadcast();
    }

    pub fn request_failed(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        self.broadcast();
    }

    /// An MQTT message passed topic, dedup and validation checks
    pub fn mqtt_message_accepted(&self) {
        self.mqtt_messages.fetch_add(1, Ordering::Relaxed);
        self.broadcast();
    }

    pub fn client_connected(&self) {
        self.connected_clients.fetch_add(1, Ordering::Relaxed);
        self.broadcast();
    }

    pub fn client_disconnected(&self) {
        let _ = self
            .connected_clients
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        self.broadcast();
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn snapshot(&self) -> Stats {
        Stats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            mqtt_messages: self.mqtt_messages.load(Ordering::Relaxed),
            zabbix_sends: self.zabbix_sends.load(Ordering::Relaxed),
            connected_clients: self.connected_clients.load(Ordering::Relaxed),
            uptime: format_uptime(self.uptime()),
        }
    }

    /// Push the current snapshot to every observer
    pub fn broadcast(&self) {
        self.hub.broadcast_typed(kind::STATS, &self.snapshot());
    }

    /// Broadcast stats every second until `shutdown` flips to true
    pub fn spawn_uptime_ticker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(UPTIME_TICK);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => self.broadcast(),
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Uptime ticker stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator() -> StatsAggregator {
        StatsAggregator::new(Arc::new(EventHub::new()))
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(Duration::ZERO), "0s");
        assert_eq!(format_uptime(Duration::from_secs(59)), "59s");
        assert_eq!(format_uptime(Duration::from_secs(61)), "1m 1s");
        assert_eq!(format_uptime(Duration::from_secs(3_600)), "1h 0m 0s");
        assert_eq!(format_uptime(Duration::from_secs(93_784)), "1d 2h 3m 4s");
    }

    #[test]
    fn test_counters() {
        let stats = aggregator();
        stats.request_received();
        stats.request_received();
        stats.request_succeeded();
        stats.request_failed();
        stats.mqtt_message_accepted();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.successful_requests, 1);
        assert_eq!(snapshot.zabbix_sends, 1);
        assert_eq!(snapshot.failed_requests, 1);
        assert_eq!(snapshot.mqtt_messages, 1);
        assert_eq!(snapshot.uptime, "0s");
    }

    #[test]
    fn test_connected_clients_never_underflows() {
        let stats = aggregator();
        stats.client_disconnected();
        assert_eq!(stats.snapshot().connected_clients, 0);

        stats.client_connected();
        stats.client_connected();
        stats.client_disconnected();
        assert_eq!(stats.snapshot().connected_clients, 1);
    }

    #[tokio::test]
    async fn test_mutations_broadcast_snapshots() {
        let hub = Arc::new(EventHub::new());
        let stats = StatsAggregator::new(hub.clone());
        let mut observer = hub.attach();

        stats.request_received();

        let frame = observer.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "stats");
        assert_eq!(value["data"]["total_requests"], 1);
    }

    #[tokio::test]
    async fn test_ticker_stops_on_shutdown() {
        let stats = Arc::new(aggregator());
        let (tx, rx) = watch::channel(false);
        let handle = stats.spawn_uptime_ticker(rx);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("ticker should stop")
            .unwrap();
    }
}
