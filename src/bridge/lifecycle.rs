//! Bridge context: the one owner of the process-wide state
//!
//! [`Bridge`] is built once at startup and handed to the HTTP layer and the
//! push server behind an `Arc`. It wires the event hub, counters, ingester and
//! subscription manager together and runs the start and shutdown sequences.

use super::ingester::BridgeIngester;
use crate::config::{ConfigStore, MqttSection};
use crate::error::{BridgeError, BridgeResult};
use crate::observability::events::{kind, EventHub};
use crate::observability::stats::StatsAggregator;
use crate::transport::mqtt::{BridgeStatus, SubscriptionManager};
use crate::transport::{TrapperClient, TrapperSender};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Result of an MQTT settings change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsUpdate {
    /// Whether the stored settings differed
    pub changed: bool,
    /// Set when the new settings were saved but the restart reported an error
    pub restart_error: Option<String>,
}

pub struct Bridge {
    config: Arc<ConfigStore>,
    hub: Arc<EventHub>,
    stats: Arc<StatsAggregator>,
    ingester: Arc<BridgeIngester>,
    subscriptions: Mutex<SubscriptionManager>,
    status_rx: watch::Receiver<BridgeStatus>,
    shutdown_tx: watch::Sender<bool>,
    ticker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Bridge {
    /// Wire a bridge around an injected trapper
    pub fn new(config: Arc<ConfigStore>, trapper: Arc<dyn TrapperSender>) -> Self {
        let hub = Arc::new(EventHub::new());
        let stats = Arc::new(StatsAggregator::new(hub.clone()));
        let ingester = Arc::new(BridgeIngester::new(trapper, hub.clone(), stats.clone()));
        let subscriptions = SubscriptionManager::new(hub.clone(), ingester.clone());
        let status_rx = subscriptions.subscribe_status();
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            hub,
            stats,
            ingester,
            subscriptions: Mutex::new(subscriptions),
            status_rx,
            shutdown_tx,
            ticker: std::sync::Mutex::new(None),
        }
    }

    /// Wire a bridge that talks to real trapper servers
    pub fn from_store(config: Arc<ConfigStore>) -> Self {
        let timeout = config.get().trapper.timeout();
        Self::new(config, Arc::new(TrapperClient::new(timeout)))
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    pub fn stats(&self) -> &Arc<StatsAggregator> {
        &self.stats
    }

    pub fn ingester(&self) -> &Arc<BridgeIngester> {
        &self.ingester
    }

    /// Current MQTT status; never waits on a pending restart
    pub fn mqtt_status(&self) -> BridgeStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<BridgeStatus> {
        self.status_rx.clone()
    }

    /// Start the uptime ticker and, when enabled, the MQTT subscription.
    ///
    /// A broker that cannot be reached is not an error here; the subscription
    /// keeps retrying on its own. Only unusable settings are returned.
    pub async fn start(&self) -> BridgeResult<()> {
        info!("Starting bridge");
        self.spawn_ticker();
        self.hub.emit(kind::INFO, "Bridge started");

        let mqtt = self.config.mqtt();
        let mut subscriptions = self.subscriptions.lock().await;
        subscriptions.start(&mqtt).await?;
        Ok(())
    }

    fn spawn_ticker(&self) {
        let mut ticker = self.ticker.lock().unwrap_or_else(|p| p.into_inner());
        if ticker.is_none() {
            let handle = self
                .stats
                .clone()
                .spawn_uptime_ticker(self.shutdown_tx.subscribe());
            *ticker = Some(handle);
        }
    }

    /// Apply new MQTT settings.
    ///
    /// The masked password keeps the stored one. Settings are written to disk
    /// before they take effect; a failed write leaves both the in-memory
    /// configuration and the running subscription untouched. The subscription
    /// restarts only when something actually changed.
    ///
    /// The subscription lock is held from the save through the restart, so
    /// concurrent updates restart in the order they were saved.
    pub async fn update_mqtt_settings(&self, incoming: MqttSection) -> BridgeResult<SettingsUpdate> {
        let mut subscriptions = self.subscriptions.lock().await;

        let stored = self.config.mqtt();
        let merged = incoming.merged_with(&stored);
        merged.validate()?;

        let changed = self
            .config
            .update_mqtt(merged.clone())
            .map_err(BridgeError::persistence)?;

        if !changed {
            return Ok(SettingsUpdate {
                changed: false,
                restart_error: None,
            });
        }

        info!(enabled = merged.enabled, topic = %merged.topic, "MQTT settings changed, restarting subscription");
        let restart_error = match subscriptions.restart(&merged).await {
            Ok(()) => None,
            Err(e) => {
                warn!(error = %e, "MQTT restart failed");
                Some(crate::error::sanitize_error_message(&e.to_string()))
            }
        };

        Ok(SettingsUpdate {
            changed: true,
            restart_error,
        })
    }

    /// Stop the subscription and the ticker
    pub async fn shutdown(&self) {
        info!("Shutting down bridge");
        let _ = self.shutdown_tx.send(true);

        self.subscriptions.lock().await.disconnect().await;

        let handle = self.ticker.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("Uptime ticker shutdown error: {}", e);
                }
            }
        }

        info!("Bridge shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::testing::mocks::MockTrapper;
    use crate::transport::mqtt::ConnectionState;

    fn bridge_with(config: BridgeConfig) -> Bridge {
        Bridge::new(
            Arc::new(ConfigStore::in_memory(config)),
            Arc::new(MockTrapper::new()),
        )
    }

    #[tokio::test]
    async fn test_start_with_mqtt_disabled() {
        let bridge = bridge_with(BridgeConfig::default());

        bridge.start().await.unwrap();

        assert_eq!(bridge.mqtt_status().status, ConnectionState::Disabled);
        bridge.shutdown().await;
        assert_eq!(bridge.mqtt_status().status, ConnectionState::Stopped);
    }

    #[tokio::test]
    async fn test_unchanged_settings_do_not_restart() {
        let bridge = bridge_with(BridgeConfig::default());
        bridge.start().await.unwrap();

        let update = bridge
            .update_mqtt_settings(MqttSection::default())
            .await
            .unwrap();

        assert!(!update.changed);
        assert_eq!(bridge.mqtt_status().status, ConnectionState::Disabled);
        bridge.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_settings_rejected_before_saving() {
        let bridge = bridge_with(BridgeConfig::default());

        let err = bridge
            .update_mqtt_settings(MqttSection {
                enabled: true,
                url: "http://nope".to_string(),
                topic: "t".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "validation_error");
        assert!(!bridge.config().mqtt().enabled);
    }

    #[tokio::test]
    async fn test_masked_password_keeps_stored_one() {
        let mut config = BridgeConfig::default();
        config.mqtt.password = "hunter2".to_string();
        let bridge = bridge_with(config);

        let update = bridge
            .update_mqtt_settings(MqttSection {
                password: "***".to_string(),
                topic: "new/topic".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(update.changed);
        assert!(update.restart_error.is_none());
        let stored = bridge.config().mqtt();
        assert_eq!(stored.password, "hunter2");
        assert_eq!(stored.topic, "new/topic");
        assert_eq!(bridge.mqtt_status().status, ConnectionState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_leave_live_session_on_stored_settings() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let bridge = Arc::new(bridge_with(BridgeConfig::default()));
        let updates = (0..4).map(|i| {
            let bridge = bridge.clone();
            tokio::spawn(async move {
                bridge
                    .update_mqtt_settings(MqttSection {
                        enabled: true,
                        url: format!("mqtt://127.0.0.1:{port}"),
                        topic: format!("sensors/{i}"),
                        ..Default::default()
                    })
                    .await
            })
        });
        for handle in updates.collect::<Vec<_>>() {
            assert!(handle.await.unwrap().unwrap().changed);
        }

        assert_eq!(bridge.mqtt_status().topic, bridge.config().mqtt().topic);
        bridge.shutdown().await;
    }
}
