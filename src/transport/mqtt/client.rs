//! Subscription manager: owns the MQTT session and its supervisor task
//!
//! `connect` spawns one supervisor per session. The supervisor polls the
//! rumqttc event loop, routes events through [`MessageHandler`], asks
//! [`HealthMonitor`] what to do on errors, and rebuilds the client after each
//! backoff. Admitted messages go to a single delivery worker per session, so
//! they reach the trapper one at a time in arrival order. A `watch` channel carries the shutdown signal so `disconnect` can
//! stop it even in the middle of a backoff wait.

use super::connection::{
    configure_mqtt_options, BridgeStatus, ConnectionState, MqttError, ReconnectConfig,
    REQUEST_CHANNEL_CAPACITY,
};
use super::health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
use super::message_handler::{DedupWindow, EventRoute, MessageHandler};
use crate::bridge::BridgeIngester;
use crate::config::MqttSection;
use crate::error::sanitize_error_message;
use crate::observability::events::{kind, EventHub};
use bytes::Bytes;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, EventLoop, Outgoing, QoS};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Pause between tearing a session down and starting the next one
pub const SETTLE_DELAY: Duration = Duration::from_millis(500);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
const DISCONNECT_FLUSH: Duration = Duration::from_millis(250);

/// Publishes status transitions to the watch channel and to observers
#[derive(Clone)]
pub struct StatusReporter {
    tx: Arc<watch::Sender<BridgeStatus>>,
    hub: Arc<EventHub>,
}

impl StatusReporter {
    fn new(hub: Arc<EventHub>) -> (Self, watch::Receiver<BridgeStatus>) {
        let (tx, rx) = watch::channel(BridgeStatus::default());
        (
            Self {
                tx: Arc::new(tx),
                hub,
            },
            rx,
        )
    }

    pub fn current(&self) -> BridgeStatus {
        self.tx.borrow().clone()
    }

    /// Move to `state`, keeping the rest of the status
    pub fn report(&self, state: ConnectionState) {
        let mut from = ConnectionState::Unknown;
        self.tx.send_modify(|status| {
            from = status.status;
            status.status = state;
            status.last_updated = Utc::now();
        });
        self.publish(from, state);
    }

    /// Replace the whole status from new settings
    pub fn reset(&self, config: &MqttSection, state: ConnectionState) {
        let previous = self.tx.send_replace(BridgeStatus::for_settings(config, state));
        self.publish(previous.status, state);
    }

    /// Mark the service as switched off
    fn stopped(&self) {
        let mut from = ConnectionState::Unknown;
        self.tx.send_modify(|status| {
            from = status.status;
            status.enabled = false;
            status.status = ConnectionState::Stopped;
            status.last_updated = Utc::now();
        });
        self.publish(from, ConnectionState::Stopped);
    }

    fn publish(&self, from: ConnectionState, to: ConnectionState) {
        HealthMonitor::log_state_transition(from, to);
        self.hub.broadcast_typed(kind::MQTT_STATUS, &self.current());
    }
}

/// Everything the supervisor task needs
struct SessionContext {
    config: MqttSection,
    reconnect: ReconnectConfig,
    reporter: StatusReporter,
    hub: Arc<EventHub>,
    ingester: Arc<BridgeIngester>,
}

/// Admitted message waiting for delivery: `(topic, payload text)`
type Delivery = (String, String);

struct Session {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Lifecycle owner for the MQTT subscription
pub struct SubscriptionManager {
    hub: Arc<EventHub>,
    ingester: Arc<BridgeIngester>,
    reconnect_config: ReconnectConfig,
    reporter: StatusReporter,
    status_rx: watch::Receiver<BridgeStatus>,
    session: Option<Session>,
}

impl SubscriptionManager {
    pub fn new(hub: Arc<EventHub>, ingester: Arc<BridgeIngester>) -> Self {
        Self::with_reconnect_config(hub, ingester, ReconnectConfig::default())
    }

    pub fn with_reconnect_config(
        hub: Arc<EventHub>,
        ingester: Arc<BridgeIngester>,
        reconnect_config: ReconnectConfig,
    ) -> Self {
        let (reporter, status_rx) = StatusReporter::new(hub.clone());
        Self {
            hub,
            ingester,
            reconnect_config,
            reporter,
            status_rx,
            session: None,
        }
    }

    pub fn status(&self) -> BridgeStatus {
        self.reporter.current()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<BridgeStatus> {
        self.status_rx.clone()
    }

    /// True while a supervisor task is alive
    pub fn is_active(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| !session.handle.is_finished())
    }

    /// Honour the `enabled` flag: report `Disabled`, or go through `Starting` into `connect`
    pub async fn start(&mut self, config: &MqttSection) -> Result<(), MqttError> {
        if !config.enabled {
            self.reporter.reset(config, ConnectionState::Disabled);
            self.hub.emit(kind::INFO, "MQTT: Service disabled");
            return Ok(());
        }

        self.reporter.reset(config, ConnectionState::Starting);
        self.connect(config).await
    }

    /// Validate settings and spawn the supervisor.
    ///
    /// Invalid settings report `Error` and make no connection attempt. Any
    /// existing session is stopped first.
    pub async fn connect(&mut self, config: &MqttSection) -> Result<(), MqttError> {
        if self.session.is_some() {
            self.stop_session().await;
        }

        let (client, event_loop) = match Self::create_connection(config) {
            Ok(pair) => pair,
            Err(e) => {
                self.reporter.reset(config, ConnectionState::Error);
                self.hub.emit(
                    kind::ERROR,
                    format!("MQTT: Connection error: {}", sanitize_error_message(&e.to_string())),
                );
                return Err(e);
            }
        };

        self.hub.emit(
            kind::INFO,
            format!("MQTT: Connecting to {}", sanitize_error_message(&config.url)),
        );
        self.reporter.reset(config, ConnectionState::Connecting);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = SessionContext {
            config: config.clone(),
            reconnect: self.reconnect_config.clone(),
            reporter: self.reporter.clone(),
            hub: self.hub.clone(),
            ingester: self.ingester.clone(),
        };
        let span = crate::mqtt_span!(topic = %config.topic);
        let handle = tokio::spawn(
            Self::run_session(ctx, client, event_loop, shutdown_rx).instrument(span),
        );

        self.session = Some(Session {
            shutdown_tx,
            handle,
        });
        Ok(())
    }

    /// Stop the session and report `Stopped` with `enabled = false`.
    ///
    /// The supervisor is joined before `Stopped` is published, so no later
    /// status from the old session can follow it.
    pub async fn disconnect(&mut self) {
        if self.stop_session().await {
            self.hub.emit(kind::INFO, "MQTT: Service stopped");
        } else {
            self.hub
                .emit(kind::INFO, "MQTT: Service already stopped or not running");
        }
        self.reporter.stopped();
    }

    /// Disconnect, settle, then start again if the new settings are enabled
    pub async fn restart(&mut self, config: &MqttSection) -> Result<(), MqttError> {
        self.disconnect().await;
        tokio::time::sleep(SETTLE_DELAY).await;

        if !config.enabled {
            self.hub.emit(kind::INFO, "MQTT: Service disabled");
            return Ok(());
        }

        self.reporter.reset(config, ConnectionState::Starting);
        self.connect(config).await?;
        self.hub
            .emit(kind::INFO, "MQTT: Service restarted with new configuration");
        Ok(())
    }

    async fn stop_session(&mut self) -> bool {
        let Some(session) = self.session.take() else {
            return false;
        };

        let _ = session.shutdown_tx.send(true);
        let mut handle = session.handle;
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await {
            Ok(_) => debug!("MQTT supervisor stopped"),
            Err(_) => {
                warn!("MQTT supervisor did not stop in time, aborting");
                handle.abort();
            }
        }
        true
    }

    fn create_connection(config: &MqttSection) -> Result<(AsyncClient, EventLoop), MqttError> {
        let options = configure_mqtt_options(config)?;
        Ok(AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY))
    }

    async fn run_session(
        ctx: SessionContext,
        mut client: AsyncClient,
        mut event_loop: EventLoop,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!(url = %sanitize_error_message(&ctx.config.url), "Starting MQTT supervisor");
        let mut attempts = 0u32;
        let mut running = false;
        let mut dedup = DedupWindow::new(ctx.config.period());
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        tokio::spawn(
            Self::delivery_worker(ctx.ingester.clone(), delivery_rx).in_current_span(),
        );

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        if running {
                            Self::flush_disconnect(&client, &mut event_loop).await;
                        }
                        break;
                    }
                }

                polled = event_loop.poll() => match polled {
                    Ok(event) => {
                        let route = MessageHandler::route_mqtt_event(&event);
                        Self::process_event_route(
                            &ctx,
                            route,
                            &client,
                            &delivery_tx,
                            &mut attempts,
                            &mut running,
                            &mut dedup,
                        );
                    }
                    Err(e) => {
                        let decision = HealthMonitor::on_transport_error(
                            attempts,
                            running,
                            &ctx.reconnect,
                            *shutdown_rx.borrow(),
                        );
                        let detail = sanitize_error_message(&e.to_string());
                        let was_running = running;
                        running = false;

                        match decision {
                            ReconnectionDecision::Proceed { attempt, delay, state } => {
                                attempts = attempt;
                                if was_running {
                                    warn!(error = %detail, "MQTT connection lost");
                                    ctx.hub.emit(kind::INFO, "MQTT: Connection offline");
                                } else {
                                    warn!(attempt, error = %detail, "MQTT connection attempt failed");
                                    ctx.hub.emit(kind::ERROR, format!("MQTT Error: {detail}"));
                                }
                                ctx.reporter.report(state);

                                info!(
                                    "Attempting reconnection {}/{} after {}s delay",
                                    attempt.max(1),
                                    ctx.reconnect.max_attempts,
                                    delay.as_secs()
                                );
                                if !Self::interruptible_sleep(shutdown_rx.clone(), delay).await {
                                    break;
                                }
                                if *shutdown_rx.borrow() {
                                    break;
                                }
                                if !Self::apply_new_connection(&ctx, &mut client, &mut event_loop) {
                                    break;
                                }
                            }
                            ReconnectionDecision::AbortShutdownRequested => break,
                            ReconnectionDecision::AbortMaxAttemptsExceeded { attempts: failed } => {
                                ctx.hub.emit(kind::ERROR, format!("MQTT Error: {detail}"));
                                ctx.reporter.report(HealthMonitor::failure_state(failed));
                                let reason = format!("gave up after {failed} failed connection attempts");
                                ctx.hub.emit(kind::ERROR, format!("MQTT: Connection {reason}"));
                                ctx.reporter.report(HealthMonitor::determine_next_state(
                                    &ConnectionEvent::PermanentFailure(reason),
                                ));
                                break;
                            }
                        }
                    }
                }
            }
        }

        info!("MQTT supervisor stopped");
    }

    fn process_event_route(
        ctx: &SessionContext,
        route: EventRoute,
        client: &AsyncClient,
        delivery_tx: &mpsc::UnboundedSender<Delivery>,
        attempts: &mut u32,
        running: &mut bool,
        dedup: &mut DedupWindow,
    ) {
        match route {
            EventRoute::ConnectionAcknowledged => {
                *attempts = 0;
                *running = true;
                ctx.reporter.report(HealthMonitor::determine_next_state(
                    &ConnectionEvent::ConnAckReceived,
                ));
                ctx.hub.emit(
                    kind::INFO,
                    format!("MQTT: Connected to {}", sanitize_error_message(&ctx.config.url)),
                );

                // Non-blocking: the event loop is not polled while this runs
                if let Err(e) = client.try_subscribe(ctx.config.topic.clone(), QoS::AtLeastOnce) {
                    let reason = e.to_string();
                    error!(topic = %ctx.config.topic, error = %reason, "Failed to request subscription");
                    ctx.hub
                        .emit(kind::ERROR, format!("MQTT: Subscription error: {reason}"));
                    ctx.reporter.report(HealthMonitor::determine_next_state(
                        &ConnectionEvent::SubscriptionRejected(reason),
                    ));
                }
            }
            EventRoute::SubscriptionConfirmed { result } => match result {
                Ok(()) => {
                    ctx.hub.emit(
                        kind::INFO,
                        format!("MQTT: Subscribed to topic {}", ctx.config.topic),
                    );
                }
                Err(reason) => {
                    ctx.hub
                        .emit(kind::ERROR, format!("MQTT: Subscription error: {reason}"));
                    ctx.reporter.report(HealthMonitor::determine_next_state(
                        &ConnectionEvent::SubscriptionRejected(reason),
                    ));
                }
            },
            EventRoute::MessageReceived { topic, payload } => {
                Self::handle_message_received(ctx, dedup, delivery_tx, topic, payload);
            }
            EventRoute::Disconnected => {
                *running = false;
                ctx.hub.emit(kind::INFO, "MQTT: Disconnected by broker");
                ctx.reporter.report(HealthMonitor::determine_next_state(
                    &ConnectionEvent::DisconnectedByBroker,
                ));
            }
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event);
            }
            EventRoute::OutgoingEvent => {}
        }
    }

    fn handle_message_received(
        ctx: &SessionContext,
        dedup: &mut DedupWindow,
        delivery_tx: &mpsc::UnboundedSender<Delivery>,
        topic: String,
        payload: Bytes,
    ) {
        if !MessageHandler::should_process_message(&topic, &ctx.config.topic) {
            return;
        }

        let Some(text) = MessageHandler::payload_text(&payload) else {
            info!(topic = %topic, "Received empty MQTT payload, skipping");
            return;
        };

        if !dedup.try_admit(Instant::now()) {
            debug!(
                topic = %topic,
                period_secs = dedup.period().as_secs(),
                "MQTT message inside dedup window, dropped"
            );
            return;
        }

        if delivery_tx.send((topic, text)).is_err() {
            warn!("MQTT delivery worker gone, message dropped");
        }
    }

    /// Deliver admitted messages one at a time.
    ///
    /// Ends once the supervisor drops its sender; messages already queued
    /// are still delivered.
    async fn delivery_worker(
        ingester: Arc<BridgeIngester>,
        mut delivery_rx: mpsc::UnboundedReceiver<Delivery>,
    ) {
        while let Some((topic, text)) = delivery_rx.recv().await {
            if let Err(e) = ingester.ingest_mqtt(&topic, &text).await {
                debug!(kind = e.kind(), "MQTT message not delivered");
            }
        }
        debug!("MQTT delivery worker stopped");
    }

    /// Sleep unless shutdown arrives first; returns false on shutdown
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay: Duration) -> bool {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Shutdown signal received during reconnection delay, stopping");
                    return false;
                }
                true
            }
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Swap in a fresh client and event loop; false if the settings no longer build
    fn apply_new_connection(
        ctx: &SessionContext,
        client: &mut AsyncClient,
        event_loop: &mut EventLoop,
    ) -> bool {
        match Self::create_connection(&ctx.config) {
            Ok((new_client, new_event_loop)) => {
                debug!("Created new connection for reconnection attempt");
                *client = new_client;
                *event_loop = new_event_loop;
                true
            }
            Err(e) => {
                error!(error = %e, "Failed to create new connection");
                ctx.reporter.report(ConnectionState::Error);
                false
            }
        }
    }

    /// Best-effort DISCONNECT before dropping the socket
    async fn flush_disconnect(client: &AsyncClient, event_loop: &mut EventLoop) {
        if client.try_disconnect().is_err() {
            return;
        }
        let flush = async {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        };
        let _ = tokio::time::timeout(DISCONNECT_FLUSH, flush).await;
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        if let Some(session) = &self.session {
            let _ = session.shutdown_tx.send(true);
        }
    }
}
