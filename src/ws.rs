//! WebSocket signaling transport
//!
//! Connects to the relay's WebSocket endpoint and exchanges JSON-encoded
//! [`SignalingMessage`]s as text frames. Receivers authenticate with the
//! token issued when their code was redeemed.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::error::ShareError;
use crate::transport::SignalingTransport;
use crate::types::SignalingMessage;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Signaling transport over a relay WebSocket
pub struct WebSocketTransport {
    url: String,
    token: Option<String>,
    writer: Mutex<Option<SplitSink<WsStream, Message>>>,
    reader: Mutex<Option<SplitStream<WsStream>>>,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            url: url.into(),
            token,
            writer: Mutex::new(None),
            reader: Mutex::new(None),
        }
    }

    fn request_url(&self) -> String {
        match &self.token {
            Some(token) => {
                let sep = if self.url.contains('?') { '&' } else { '?' };
                format!("{}{}token={}", self.url, sep, token)
            }
            None => self.url.clone(),
        }
    }
}

#[async_trait]
impl SignalingTransport for WebSocketTransport {
    async fn connect(&self) -> Result<(), ShareError> {
        let url = self.request_url();
        let (stream, _response) = connect_async(&url)
            .await
            .map_err(|e| ShareError::SignalingUnreachable(format!("websocket connect: {e}")))?;
        let (write, read) = stream.split();
        *self.writer.lock().await = Some(write);
        *self.reader.lock().await = Some(read);
        debug!(url = %self.url, "websocket connected");
        Ok(())
    }

    async fn send(&self, msg: &SignalingMessage) -> Result<(), ShareError> {
        let json = serde_json::to_string(msg)
            .map_err(|e| ShareError::SignalingUnreachable(format!("encode: {e}")))?;
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| ShareError::SignalingUnreachable("not connected".to_string()))?;
        writer
            .send(Message::Text(json))
            .await
            .map_err(|e| ShareError::SignalingUnreachable(format!("websocket send: {e}")))
    }

    async fn recv(&self) -> Option<SignalingMessage> {
        loop {
            let frame = {
                let mut guard = self.reader.lock().await;
                let reader = guard.as_mut()?;
                reader.next().await
            };
            match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                    Ok(msg) => return Some(msg),
                    Err(e) => {
                        warn!(error = %e, "ignoring unparsable signaling frame");
                        continue;
                    }
                },
                // Ping/pong are handled by tungstenite; binary frames do not
                // belong on signaling.
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    *self.reader.lock().await = None;
                    *self.writer.lock().await = None;
                    return None;
                }
                Some(Ok(_)) => continue,
            }
        }
    }

    async fn disconnect(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.send(Message::Close(None)).await;
        }
        *self.reader.lock().await = None;
    }
}
