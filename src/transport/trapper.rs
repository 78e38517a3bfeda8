//! One-shot TCP client for the Zabbix trapper
//!
//! Each send opens a fresh connection, writes one framed request, reads the
//! reply until the server closes, and drops the socket. Connect, write and
//! read share a single time budget.

use super::TrapperSender;
use crate::protocol::codec::{self, EncodingError};
use crate::protocol::{ServerAddress, TelemetryBatch};
use crate::trapper_span;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn, Instrument};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Debug, Error)]
pub enum SendError {
    #[error("Invalid Zabbix server address: {0}")]
    InvalidAddress(String),
    #[error("Failed to encode trapper request: {0}")]
    Encoding(#[from] EncodingError),
    #[error("Zabbix server did not answer within {0} ms")]
    Timeout(u64),
    #[error("Zabbix network error: {0}")]
    Network(#[from] std::io::Error),
}

impl SendError {
    pub fn kind(&self) -> &'static str {
        match self {
            SendError::InvalidAddress(_) | SendError::Encoding(_) => "validation_error",
            SendError::Timeout(_) => "timeout",
            SendError::Network(_) => "network_error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrapperClient {
    timeout: Duration,
}

impl Default for TrapperClient {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl TrapperClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn resolve(server: &ServerAddress) -> Result<SocketAddr, SendError> {
        let mut addrs = tokio::net::lookup_host((server.host.as_str(), server.port))
            .await
            .map_err(|e| SendError::InvalidAddress(format!("{server}: {e}")))?;
        addrs
            .next()
            .ok_or_else(|| SendError::InvalidAddress(format!("{server}: no addresses found")))
    }

    async fn exchange(server: &ServerAddress, packet: &[u8]) -> Result<Vec<u8>, SendError> {
        let addr = Self::resolve(server).await?;
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(packet).await?;
        stream.flush().await?;

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await?;
        Ok(response)
    }
}

#[async_trait::async_trait]
impl TrapperSender for TrapperClient {
    async fn send(&self, batch: &TelemetryBatch) -> Result<String, SendError> {
        let server = batch.server();
        let span = trapper_span!(server = %server, items = batch.len());

        async {
            let packet = codec::encode(batch)?;
            debug!(bytes = packet.len(), "Sending trapper request");

            let response = match tokio::time::timeout(self.timeout, Self::exchange(server, &packet)).await {
                Ok(result) => result?,
                Err(_) => {
                    let millis = self.timeout.as_millis() as u64;
                    warn!(timeout_ms = millis, "Trapper request timed out");
                    return Err(SendError::Timeout(millis));
                }
            };

            debug!(bytes = response.len(), "Received trapper response");
            Ok(String::from_utf8_lossy(codec::strip_header(&response)).into_owned())
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TelemetryItem;
    use tokio::net::TcpListener;

    fn batch_for(addr: SocketAddr) -> TelemetryBatch {
        TelemetryBatch::new(
            ServerAddress::new(addr.ip().to_string(), addr.port()).unwrap(),
            "sensor1",
            vec![TelemetryItem::numeric("temp", "21.5").unwrap()],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_send_reads_response_until_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut header = [0u8; codec::HEADER_LEN];
            socket.read_exact(&mut header).await.unwrap();
            let len = u64::from_le_bytes(header[5..].try_into().unwrap()) as usize;
            let mut body = vec![0u8; len];
            socket.read_exact(&mut body).await.unwrap();

            socket
                .write_all(&codec::frame(br#"{"response":"success"}"#))
                .await
                .unwrap();
            body
        });

        let client = TrapperClient::new(Duration::from_secs(2));
        let response = client.send(&batch_for(addr)).await.unwrap();
        assert_eq!(response, r#"{"response":"success"}"#);

        let body = server.await.unwrap();
        assert!(String::from_utf8(body).unwrap().contains(r#""key":"temp""#));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let _server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let client = TrapperClient::new(Duration::from_millis(100));
        let started = std::time::Instant::now();
        let err = client.send(&batch_for(addr)).await.unwrap_err();

        assert!(matches!(err, SendError::Timeout(100)));
        assert_eq!(err.kind(), "timeout");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_refused_connection_is_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = TrapperClient::default()
            .send(&batch_for(addr))
            .await
            .unwrap_err();
        assert!(matches!(err, SendError::Network(_)));
        assert_eq!(err.kind(), "network_error");
    }
}
