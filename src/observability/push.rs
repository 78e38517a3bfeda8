//! Observer push channel
//!
//! A WebSocket endpoint on the observer port. Each connection attaches to the
//! [`EventHub`](super::events::EventHub), gets the replay followed by the
//! current MQTT status and stats, then receives live frames. Text sent by an
//! observer is relayed to the others, except the literal `last`, which
//! re-sends the replay window.

use super::events::kind;
use crate::bridge::Bridge;
use crate::error::{BridgeError, BridgeResult};
use futures::{Sink, SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};
use warp::ws::{Message, WebSocket, Ws};
use warp::{Filter, Rejection, Reply};

/// Observer command asking for the replay window again
pub const REPLAY_COMMAND: &str = "last";

/// WebSocket upgrade on `/`
pub fn routes(
    bridge: Arc<Bridge>,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path::end().and(warp::ws()).map(move |ws: Ws| {
        let bridge = bridge.clone();
        ws.on_upgrade(move |socket| observer_session(socket, bridge))
    })
}

async fn send_frames<S>(sink: &mut S, frames: impl IntoIterator<Item = Arc<str>>) -> bool
where
    S: Sink<Message> + Unpin,
{
    for frame in frames {
        if sink.send(Message::text(frame.to_string())).await.is_err() {
            return false;
        }
    }
    true
}

/// Serve one observer until either side closes
pub async fn observer_session(socket: WebSocket, bridge: Arc<Bridge>) {
    let hub = bridge.hub().clone();
    bridge.stats().client_connected();

    let mut observer = hub.attach();
    let id = observer.id();
    info!(observer = %id, "Observer connected");

    let (mut sink, mut stream) = socket.split();

    let mut initial = observer.take_replay();
    initial.extend(hub.typed_frame(kind::MQTT_STATUS, &bridge.mqtt_status()));
    initial.extend(hub.typed_frame(kind::STATS, &bridge.stats().snapshot()));

    if send_frames(&mut sink, initial).await {
        loop {
            tokio::select! {
                incoming = stream.next() => match incoming {
                    Some(Ok(message)) => {
                        if message.is_close() {
                            break;
                        }
                        let Ok(text) = message.to_str() else {
                            continue;
                        };
                        if text.trim() == REPLAY_COMMAND {
                            if !send_frames(&mut sink, hub.replay_last()).await {
                                break;
                            }
                        } else {
                            hub.relay(id, text);
                        }
                    }
                    Some(Err(e)) => {
                        debug!(observer = %id, error = %e, "Observer socket error");
                        break;
                    }
                    None => break,
                },
                outgoing = observer.recv() => match outgoing {
                    Some(frame) => {
                        if !send_frames(&mut sink, [frame]).await {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    }

    drop(observer);
    bridge.stats().client_disconnected();
    info!(observer = %id, "Observer disconnected");
}

/// Standalone server for the push channel
pub struct PushServer {
    bridge: Arc<Bridge>,
    port: u16,
}

impl PushServer {
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
                BridgeError::internal(format!("failed to bind observer port {}: {e}", self.port))
            })?;

        info!("Observer channel listening on {}", bound);
        server.await;
        Ok(())
    }
}
