use std::net::SocketAddr;

use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use crate::error::{ChatError, ChatResult};
use crate::message::ServerEvent;

pub type WebSocketStreamType = WebSocketStream<TcpStream>;

/// Write half of one client socket. Direct replies and error events go
/// through here; broadcasts reach the connection through its outbound
/// channel instead.
pub struct ConnectionHandler {
    ws_sender: SplitSink<WebSocketStreamType, WsMessage>,
    addr: SocketAddr,
}

impl ConnectionHandler {
    pub fn new(ws_sender: SplitSink<WebSocketStreamType, WsMessage>, addr: SocketAddr) -> Self {
        Self { ws_sender, addr }
    }

    pub async fn send_event(&mut self, event: &ServerEvent) -> ChatResult<()> {
        let json = serde_json::to_string(event)?;
        self.ws_sender.send(WsMessage::Text(json)).await?;
        Ok(())
    }

    /// Best-effort: a client that vanished mid-error is not worth failing on.
    pub async fn send_error(&mut self, err: &ChatError) {
        if self.send_event(&ServerEvent::from_error(err)).await.is_err() {
            debug!(addr = %self.addr, "Failed to send error to disconnected client");
        }
    }

    pub async fn pong(&mut self, data: Vec<u8>) -> ChatResult<()> {
        self.ws_sender.send(WsMessage::Pong(data)).await?;
        Ok(())
    }

    pub async fn close(&mut self) {
        let _ = self.ws_sender.send(WsMessage::Close(None)).await;
    }
}
