use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use super::{Link, Transport};
use crate::error::{SyncError, SyncResult};

/// WebSocket transport over tokio-tungstenite
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, endpoint: &Url) -> SyncResult<Box<dyn Link>> {
        // A refused upgrade surfaces as "HTTP error: 401 Unauthorized"
        let (stream, _response) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| SyncError::from_transport_text(e.to_string()))?;
        debug!("WebSocket connected to {}", endpoint.path());
        Ok(Box::new(WebSocketLink { stream }))
    }
}

struct WebSocketLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Link for WebSocketLink {
    async fn send(&mut self, frame: Vec<u8>) -> SyncResult<()> {
        self.stream
            .send(Message::Binary(frame))
            .await
            .map_err(|e| SyncError::from_transport_text(e.to_string()))
    }

    async fn recv(&mut self) -> Option<SyncResult<Vec<u8>>> {
        while let Some(message) = self.stream.next().await {
            match message {
                Ok(Message::Binary(data)) => return Some(Ok(data)),
                Ok(Message::Close(frame)) => {
                    debug!("WebSocket closed by peer: {:?}", frame);
                    return None;
                }
                Ok(Message::Text(text)) => {
                    debug!("Ignoring text message of {} bytes", text.len());
                }
                // Ping and pong are answered by tungstenite
                Ok(_) => {}
                Err(e) => return Some(Err(SyncError::from_transport_text(e.to_string()))),
            }
        }
        None
    }

    async fn close(&mut self) -> SyncResult<()> {
        self.stream
            .close(None)
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))
    }
}
