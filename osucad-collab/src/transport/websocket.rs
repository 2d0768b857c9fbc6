//! WebSocket transport.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::SyncMessage;

use super::{Transport, TransportError};

type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WebSocketTransport {
    url: String,
    stream: Option<Stream>,
}

impl WebSocketTransport {
    /// `url` such as `ws://127.0.0.1:9090`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for WebSocketTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        if let Some(mut old) = self.stream.take() {
            let _ = old.close(None).await;
        }
        let (stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        log::debug!("Connected to {}", self.url);
        self.stream = Some(stream);
        Ok(())
    }

    async fn send(&mut self, msg: &SyncMessage) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::Closed)?;
        let encoded = msg.encode()?;
        if let Err(e) = stream.send(Message::Binary(encoded.into())).await {
            log::debug!("WebSocket send failed: {e}");
            self.stream = None;
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<SyncMessage> {
        loop {
            let stream = self.stream.as_mut()?;
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => match SyncMessage::decode(&data) {
                    Ok(msg) => return Some(msg),
                    Err(e) => log::warn!("Dropping undecodable message: {e}"),
                },
                Some(Ok(Message::Ping(data))) => {
                    let _ = stream.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    log::debug!("Connection to {} closed", self.url);
                    self.stream = None;
                    return None;
                }
                Some(Err(e)) => {
                    log::warn!("WebSocket error from {}: {e}", self.url);
                    self.stream = None;
                    return None;
                }
                Some(Ok(_)) => {}
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}
