//! Inbound HTTP API
//!
//! `GET|POST /zabbix` feed the ingester; the `/api/*` routes expose stats,
//! MQTT status, the event log and configuration. Authentication is applied
//! upstream and is not handled here.

use crate::bridge::{Bridge, Source};
use crate::config::{BridgeConfig, MqttSection};
use crate::error::{BridgeError, BridgeResult};
use crate::observability::events::EventRecord;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use warp::http::StatusCode;
use warp::{Filter, Rejection, Reply};

/// Largest accepted request body
pub const MAX_BODY_BYTES: u64 = 1024 * 1024;

const SEND_FAILURE_SUMMARY: &str = "Failed to send data to Zabbix server";
const SETTINGS_FAILURE_SUMMARY: &str = "Failed to update MQTT settings";

#[derive(Debug, Deserialize)]
struct ZabbixQuery {
    data: Option<String>,
}

/// Reply to a successful `/zabbix` call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestResponse {
    /// Normalised request
    pub data: Value,
    /// Trapper response, parsed when it is JSON
    pub result: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsResponse {
    pub logs: Vec<EventRecord>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsResponse {
    pub success: bool,
    pub message: String,
    pub mqtt_restarted: bool,
}

#[derive(Debug, Serialize)]
struct BannerResponse {
    name: &'static str,
    version: &'static str,
    endpoints: BTreeMap<&'static str, &'static str>,
}

fn with_bridge(
    bridge: Arc<Bridge>,
) -> impl Filter<Extract = (Arc<Bridge>,), Error = Infallible> + Clone {
    warp::any().map(move || bridge.clone())
}

fn error_reply(error: &BridgeError, summary: &str) -> warp::reply::WithStatus<warp::reply::Json> {
    let status = if error.is_client_error() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    warp::reply::with_status(warp::reply::json(&error.to_error_body(summary)), status)
}

async fn ingest_reply(bridge: Arc<Bridge>, raw: Bytes) -> Result<impl Reply, Infallible> {
    match bridge.ingester().ingest_raw(Source::Http, &raw).await {
        Ok(receipt) => {
            let result = serde_json::from_str::<Value>(&receipt.response)
                .unwrap_or_else(|_| Value::String(receipt.response.clone()));
            let data = serde_json::to_value(&receipt.request).unwrap_or(Value::Null);
            Ok(warp::reply::with_status(
                warp::reply::json(&IngestResponse { data, result }),
                StatusCode::OK,
            ))
        }
        Err(e) => Ok(error_reply(&BridgeError::from(e), SEND_FAILURE_SUMMARY)),
    }
}

async fn update_mqtt_reply(
    bridge: Arc<Bridge>,
    settings: MqttSection,
) -> Result<impl Reply, Infallible> {
    match bridge.update_mqtt_settings(settings).await {
        Ok(update) => {
            let message = match (&update.restart_error, update.changed) {
                (_, false) => "MQTT settings unchanged".to_string(),
                (Some(reason), true) => format!("MQTT settings saved, restart failed: {reason}"),
                (None, true) => "MQTT settings saved".to_string(),
            };
            let response = SettingsResponse {
                success: true,
                message,
                mqtt_restarted: update.changed && update.restart_error.is_none(),
            };
            Ok(warp::reply::with_status(
                warp::reply::json(&response),
                StatusCode::OK,
            ))
        }
        Err(e) => Ok(error_reply(&e, SETTINGS_FAILURE_SUMMARY)),
    }
}

/// Every HTTP route of the bridge
pub fn routes(
    bridge: Arc<Bridge>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    // GET /zabbix?data=<json>
    let zabbix_get = warp::path("zabbix")
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::query::<ZabbixQuery>())
        .and(with_bridge(bridge.clone()))
        .and_then(|query: ZabbixQuery, bridge: Arc<Bridge>| {
            ingest_reply(bridge, Bytes::from(query.data.unwrap_or_default()))
        });

    // POST /zabbix with a JSON body
    let zabbix_post = warp::path("zabbix")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::bytes())
        .and(with_bridge(bridge.clone()))
        .and_then(|body: Bytes, bridge: Arc<Bridge>| ingest_reply(bridge, body));

    let stats = warp::path!("api" / "stats")
        .and(warp::get())
        .and(with_bridge(bridge.clone()))
        .map(|bridge: Arc<Bridge>| warp::reply::json(&bridge.stats().snapshot()));

    let mqtt_status = warp::path!("api" / "mqtt" / "status")
        .and(warp::get())
        .and(with_bridge(bridge.clone()))
        .map(|bridge: Arc<Bridge>| warp::reply::json(&bridge.mqtt_status()));

    let logs = warp::path!("api" / "logs")
        .and(warp::get())
        .and(with_bridge(bridge.clone()))
        .map(|bridge: Arc<Bridge>| {
            warp::reply::json(&LogsResponse {
                logs: bridge.hub().records(),
                message: "Recent application logs".to_string(),
            })
        });

    let clear_logs = warp::path!("api" / "logs")
        .and(warp::delete())
        .and(with_bridge(bridge.clone()))
        .map(|bridge: Arc<Bridge>| {
            bridge.hub().clear();
            warp::reply::json(&ActionResponse {
                success: true,
                message: "Logs cleared".to_string(),
            })
        });

    let config = warp::path!("api" / "config")
        .and(warp::get())
        .and(with_bridge(bridge.clone()))
        .map(|bridge: Arc<Bridge>| {
            let masked: BridgeConfig = bridge.config().get().masked();
            warp::reply::json(&masked)
        });

    let update_mqtt = warp::path!("api" / "config" / "mqtt")
        .and(warp::put())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json())
        .and(with_bridge(bridge))
        .and_then(|settings: MqttSection, bridge: Arc<Bridge>| update_mqtt_reply(bridge, settings));

    let root = warp::path::end().and(warp::get()).map(|| {
        let endpoints = BTreeMap::from([
            ("/zabbix", "Send data to Zabbix (GET ?data= or POST JSON)"),
            ("/api/stats", "Request and connection counters"),
            ("/api/mqtt/status", "MQTT subscription status"),
            ("/api/logs", "Recent events (GET) or clear them (DELETE)"),
            ("/api/config", "Configuration with secrets masked"),
            ("/api/config/mqtt", "Update MQTT settings (PUT)"),
        ]);
        warp::reply::json(&BannerResponse {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            endpoints,
        })
    });

    zabbix_get
        .or(zabbix_post)
        .or(stats)
        .or(mqtt_status)
        .or(logs)
        .or(clear_logs)
        .or(config)
        .or(update_mqtt)
        .or(root)
        .with(
            warp::cors()
                .allow_any_origin()
                .allow_methods(vec!["GET", "POST", "PUT", "DELETE"])
                .allow_header("content-type"),
        )
}

/// HTTP server for the API routes
pub struct ApiServer {
    bridge: Arc<Bridge>,
    port: u16,
}

impl ApiServer {
    pub fn new(bridge: Arc<Bridge>, port: u16) -> Self {
        Self { bridge, port }
    }

    /// Bind and serve until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F) -> BridgeResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let (bound, server) = warp::serve(routes(self.bridge))
            .try_bind_with_graceful_shutdown(addr, shutdown)
            .map_err(|e| {
                BridgeError::internal(format!("failed to bind HTTP port {}: {e}", self.port))
            })?;

        info!("HTTP API listening on {}", bound);
        server.await;
        Ok(())
    }
}
