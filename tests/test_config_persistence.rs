//! Configuration loading, persistence and settings updates
//!
//! Tests focus on what ends up on disk and in memory, including the
//! persist-then-apply policy when the write fails.

use std::io::Write;
use std::sync::Arc;
use tempfile::{tempdir, NamedTempFile};
use zbx_bridge::config::{BridgeConfig, ConfigError, ConfigStore, MqttSection};
use zbx_bridge::testing::MockTrapper;
use zbx_bridge::transport::mqtt::ConnectionState;
use zbx_bridge::Bridge;

#[test]
fn test_partial_file_fills_defaults() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[mqtt]
enabled = true
url = "mqtts://broker.example.com"
topic = "plant/line1"
"#
    )
    .unwrap();

    let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.http.port, 7000);
    assert_eq!(config.observer.port, 2794);
    assert_eq!(config.trapper.timeout_ms, 1000);
    assert!(config.mqtt.enabled);
    assert_eq!(config.mqtt.period, 10);
    assert!(config.validate().is_ok());
}

#[test]
fn test_empty_file_loads() {
    let temp_file = NamedTempFile::new().unwrap();
    let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();
    assert_eq!(config, BridgeConfig::default());
}

#[test]
fn test_malformed_file_is_parse_error() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "[mqtt\nenabled = ").unwrap();

    let result = BridgeConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_missing_file_is_created_with_defaults() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("zbx-bridge.toml");

    let store = ConfigStore::load_or_create(&path).unwrap();

    assert!(path.exists());
    assert_eq!(store.get(), BridgeConfig::default());
    assert_eq!(BridgeConfig::load_from_file(&path).unwrap(), BridgeConfig::default());
}

#[test]
fn test_update_mqtt_persists_then_applies() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("zbx-bridge.toml");
    let store = ConfigStore::load_or_create(&path).unwrap();

    let settings = MqttSection {
        enabled: true,
        url: "mqtt://broker:1883".to_string(),
        topic: "sensors/#".to_string(),
        login: "bridge".to_string(),
        password: "s3cret".to_string(),
        ..Default::default()
    };

    assert!(store.update_mqtt(settings.clone()).unwrap());
    assert!(!store.update_mqtt(settings.clone()).unwrap());

    let reloaded = BridgeConfig::load_from_file(&path).unwrap();
    assert_eq!(reloaded.mqtt, settings);
    assert_eq!(store.mqtt(), settings);
}

#[test]
fn test_failed_write_leaves_memory_untouched() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("zbx-bridge.toml");
    let store = ConfigStore::load_or_create(&path).unwrap();

    std::fs::remove_file(&path).unwrap();
    std::fs::create_dir(&path).unwrap();

    let result = store.update_mqtt(MqttSection {
        topic: "changed".to_string(),
        ..Default::default()
    });

    assert!(result.is_err());
    assert_eq!(store.mqtt(), MqttSection::default());
}

#[tokio::test]
async fn test_bridge_reports_persistence_error() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("zbx-bridge.toml");
    let store = Arc::new(ConfigStore::load_or_create(&path).unwrap());
    let bridge = Bridge::new(store.clone(), Arc::new(MockTrapper::new()));
    bridge.start().await.unwrap();

    std::fs::remove_file(&path).unwrap();
    std::fs::create_dir(&path).unwrap();

    let err = bridge
        .update_mqtt_settings(MqttSection {
            topic: "changed".to_string(),
            ..Default::default()
        })
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "persistence_error");
    assert_eq!(store.mqtt().topic, "");
    assert_eq!(bridge.mqtt_status().status, ConnectionState::Disabled);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_masked_password_round_trip_through_disk() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("zbx-bridge.toml");
    let store = Arc::new(ConfigStore::load_or_create(&path).unwrap());
    store
        .update_mqtt(MqttSection {
            login: "bridge".to_string(),
            password: "s3cret".to_string(),
            ..Default::default()
        })
        .unwrap();
    let bridge = Bridge::new(store, Arc::new(MockTrapper::new()));

    let shown = bridge.config().get().masked();
    assert_eq!(shown.mqtt.password, "***");

    let mut edited = shown.mqtt.clone();
    edited.topic = "plant/line2".to_string();
    let update = bridge.update_mqtt_settings(edited).await.unwrap();
    assert!(update.changed);

    let on_disk = BridgeConfig::load_from_file(&path).unwrap();
    assert_eq!(on_disk.mqtt.password, "s3cret");
    assert_eq!(on_disk.mqtt.topic, "plant/line2");
}
