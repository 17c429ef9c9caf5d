//! WebSocket transport for the push channel.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};
use url::Url;

use crate::error::PushError;
use crate::push::{PushConnector, PushStream};

/// Connects to a fixed `ws://` or `wss://` endpoint.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    pub fn new(url: &str) -> Result<Self, PushError> {
        let url = Url::parse(url)?;
        match url.scheme() {
            "ws" | "wss" => Ok(Self { url }),
            other => Err(PushError::Closed(format!(
                "unsupported push scheme {other}"
            ))),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl PushConnector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn PushStream>, PushError> {
        debug!(target: "sync::push", url = %self.url, "connecting push socket");
        let (socket, _response) = connect_async(self.url.as_str()).await?;
        Ok(Box::new(WsStream { socket }))
    }
}

struct WsStream {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl PushStream for WsStream {
    async fn next_frame(&mut self) -> Option<Result<String, PushError>> {
        while let Some(next) = self.socket.next().await {
            match next {
                Ok(WsMessage::Text(text)) => return Some(Ok(text)),
                Ok(WsMessage::Close(frame)) => {
                    debug!(target: "sync::push", ?frame, "push socket close frame");
                    return None;
                }
                // Pings are answered by tungstenite on the next read.
                Ok(other) => trace!(target: "sync::push", kind = ?other, "skipping non-text frame"),
                Err(err) => return Some(Err(err.into())),
            }
        }
        None
    }

    async fn close(&mut self) {
        if let Err(err) = self.socket.close(None).await {
            debug!(target: "sync::push", error = %err, "push socket close failed");
        }
    }
}
