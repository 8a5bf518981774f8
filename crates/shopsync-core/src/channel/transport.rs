//! Transport seam of the push channel
//!
//! The supervisor only needs text frames in and out; `WsConnector` provides
//! them over tokio-tungstenite, tests provide scripted connections.

use crate::auth::Credential;
use crate::error::{SyncError, SyncResult};
use futures::{SinkExt, StreamExt};
use std::future::Future;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::trace;

/// One open transport session
pub trait Connection: Send + 'static {
    fn send(&mut self, text: String) -> impl Future<Output = SyncResult<()>> + Send;

    /// Next text frame. `None` once the peer closed the session.
    ///
    /// Must be cancel-safe: it is raced against commands and timers.
    fn recv(&mut self) -> impl Future<Output = Option<SyncResult<String>>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Opens transport sessions
pub trait Connector: Send + Sync + 'static {
    type Conn: Connection;

    fn connect(
        &self,
        endpoint: &str,
        credential: Option<&Credential>,
    ) -> impl Future<Output = SyncResult<Self::Conn>> + Send;
}

/// WebSocket connector
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WsConnector {
    type Conn = WsConnection;

    async fn connect(
        &self,
        endpoint: &str,
        credential: Option<&Credential>,
    ) -> SyncResult<WsConnection> {
        let mut request = endpoint
            .into_client_request()
            .map_err(|e| SyncError::transport(format!("invalid endpoint {}: {}", endpoint, e)))?;

        if let Some(credential) = credential {
            let value = HeaderValue::from_str(&credential.bearer())
                .map_err(|e| SyncError::transport(format!("invalid credential header: {}", e)))?;
            request.headers_mut().insert("authorization", value);
        }

        let (stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| SyncError::transport(e.to_string()))?;
        Ok(WsConnection { stream })
    }
}

pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Connection for WsConnection {
    async fn send(&mut self, text: String) -> SyncResult<()> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| SyncError::transport(e.to_string()))
    }

    async fn recv(&mut self) -> Option<SyncResult<String>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => trace!("Skipping non-UTF-8 binary frame"),
                },
                Ok(Message::Close(_)) => return None,
                // Ping/Pong are answered by tungstenite itself
                Ok(_) => {}
                Err(e) => return Some(Err(SyncError::transport(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
