//! WebSocket Dialer
//!
//! Opens agent sockets with tokio-tungstenite and runs one pump task per
//! socket translating frames into [`SocketEvent`]s.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use crate::connection::transport::{Dialer, Link, LinkCommand, LinkError, LinkPeer, SocketEvent};

const LINK_CAPACITY: usize = 64;

/// Production dialer
#[derive(Debug, Clone)]
pub struct WsDialer {
    connect_timeout: Duration,
}

impl WsDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WsDialer {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self, url: &str) -> Result<Link, LinkError> {
        let (ws_stream, _response) = timeout(self.connect_timeout, connect_async(url))
            .await
            .map_err(|_| LinkError::Timeout(self.connect_timeout))?
            .map_err(|e| LinkError::Handshake(e.to_string()))?;

        let (link, peer) = Link::channel(LINK_CAPACITY);
        tokio::spawn(pump(ws_stream, peer));
        Ok(link)
    }
}

/// Shuttle frames between the socket and the link until either side ends.
async fn pump(ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>, peer: LinkPeer) {
    let (mut write, mut read) = ws_stream.split();
    let LinkPeer {
        events,
        mut commands,
    } = peer;

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(LinkCommand::Ping { done }) => {
                        let result = write
                            .send(Message::Ping(Vec::new()))
                            .await
                            .map_err(|e| LinkError::Ping(e.to_string()));
                        let _ = done.send(result);
                    }
                    // Close requested, or the connection dropped its writer
                    Some(LinkCommand::Close) | None => {
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: "".into(),
                        };
                        let _ = write.send(Message::Close(Some(frame))).await;
                        let _ = write.close().await;
                        debug!("Socket closed locally");
                        break;
                    }
                }
            }

            msg = read.next() => {
                let (event, last) = match msg {
                    Some(Ok(Message::Text(text))) => (SocketEvent::Text(text), false),
                    Some(Ok(Message::Binary(data))) => (SocketEvent::Binary(data.len()), false),
                    // tungstenite queues the pong reply itself
                    Some(Ok(Message::Ping(_))) => (SocketEvent::Ping, false),
                    Some(Ok(Message::Pong(_))) => (SocketEvent::Pong, false),
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = match frame {
                            Some(f) => (Some(u16::from(f.code)), f.reason.into_owned()),
                            None => (None, String::new()),
                        };
                        (SocketEvent::Closed { code, reason }, true)
                    }
                    Some(Ok(Message::Frame(_))) => continue,
                    Some(Err(e)) => (SocketEvent::Error(e.to_string()), true),
                    None => (
                        SocketEvent::Closed {
                            code: None,
                            reason: "stream ended".to_string(),
                        },
                        true,
                    ),
                };

                trace!(?event, "Socket event");
                if events.send(event).await.is_err() || last {
                    break;
                }
            }
        }
    }
}
