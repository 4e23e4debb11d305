//! Websocket link to the collector
//!
//! One JSON text frame per protocol message.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};
use url::Url;

use shared::{ClientMessage, ServerMessage};

use crate::error::{StreamerError, StreamerResult};
use crate::traits::{Connector, MessageSink, MessageSource};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens websocket connections with tokio-tungstenite
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, endpoint: &Url) -> StreamerResult<(Box<dyn MessageSink>, Box<dyn MessageSource>)> {
        debug!("🔌 Connecting to collector at {}", endpoint);

        let (stream, _response) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| StreamerError::transport(format!("Connect to {} failed: {}", endpoint, e)))?;

        let (write, read) = stream.split();
        Ok((Box::new(WebSocketSink { write }), Box::new(WebSocketSource { read })))
    }
}

/// Write half of a websocket link
pub struct WebSocketSink {
    write: SplitSink<WsStream, Message>,
}

#[async_trait]
impl MessageSink for WebSocketSink {
    async fn send(&mut self, message: ClientMessage) -> StreamerResult<()> {
        let frame = shared::messages::encode(&message)?;
        self.write
            .send(Message::Text(frame))
            .await
            .map_err(|e| StreamerError::transport(format!("Send failed: {}", e)))
    }

    async fn close(&mut self) -> StreamerResult<()> {
        self.write
            .close()
            .await
            .map_err(|e| StreamerError::transport(format!("Close failed: {}", e)))
    }
}

/// Read half of a websocket link
pub struct WebSocketSource {
    read: SplitStream<WsStream>,
}

#[async_trait]
impl MessageSource for WebSocketSource {
    async fn next_message(&mut self) -> Option<StreamerResult<ServerMessage>> {
        loop {
            let frame = match self.read.next().await? {
                Ok(frame) => frame,
                Err(e) => return Some(Err(StreamerError::transport(format!("Receive failed: {}", e)))),
            };

            let decoded = match frame {
                Message::Text(text) => shared::messages::decode::<ServerMessage>(&text),
                Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                    Ok(text) => shared::messages::decode::<ServerMessage>(text),
                    Err(e) => {
                        warn!("⚠️ Ignoring non-UTF-8 binary frame: {}", e);
                        continue;
                    }
                },
                Message::Close(frame) => {
                    debug!("🔌 Collector closed the websocket: {:?}", frame);
                    return None;
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            };

            match decoded {
                Ok(message) => return Some(Ok(message)),
                // unknown message kinds from newer collectors are skipped
                Err(e) => warn!("⚠️ Ignoring undecodable collector frame: {}", e),
            }
        }
    }
}
