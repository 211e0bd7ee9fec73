//! Transport seam
//!
//! A [`Dialer`] opens a [`Link`] to an agent URL. A link is a pair of
//! channels: commands flow to the socket pump, [`SocketEvent`]s flow back.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Everything a socket can report to its connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// UTF-8 data frame
    Text(String),
    /// Binary data frame (payload length only; contents are opaque)
    Binary(usize),
    Ping,
    Pong,
    /// Peer closed the socket. `code` is `None` when the stream ended
    /// without a close frame.
    Closed { code: Option<u16>, reason: String },
    /// Transport error; the socket is unusable afterwards
    Error(String),
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("ping failed: {0}")]
    Ping(String),

    #[error("link closed")]
    Closed,
}

/// Commands accepted by a socket pump
#[derive(Debug)]
pub enum LinkCommand {
    /// Send an empty ping and report whether it was written
    Ping {
        done: oneshot::Sender<Result<(), LinkError>>,
    },
    /// Send a close frame and shut the socket down
    Close,
}

/// Connection-side half of an open socket
#[derive(Debug)]
pub struct Link {
    writer: LinkWriter,
    events: mpsc::Receiver<SocketEvent>,
}

/// Pump-side half of an open socket
#[derive(Debug)]
pub struct LinkPeer {
    pub events: mpsc::Sender<SocketEvent>,
    pub commands: mpsc::Receiver<LinkCommand>,
}

impl Link {
    /// Create a connected link/peer pair
    pub fn channel(capacity: usize) -> (Link, LinkPeer) {
        let (command_tx, command_rx) = mpsc::channel(capacity);
        let (event_tx, event_rx) = mpsc::channel(capacity);
        (
            Link {
                writer: LinkWriter {
                    commands: command_tx,
                },
                events: event_rx,
            },
            LinkPeer {
                events: event_tx,
                commands: command_rx,
            },
        )
    }

    pub fn split(self) -> (LinkWriter, mpsc::Receiver<SocketEvent>) {
        (self.writer, self.events)
    }
}

/// Cloneable command side of a link
#[derive(Debug, Clone)]
pub struct LinkWriter {
    commands: mpsc::Sender<LinkCommand>,
}

impl LinkWriter {
    /// Send an empty ping, waiting at most `wait` for it to be written
    pub async fn ping(&self, wait: Duration) -> Result<(), LinkError> {
        let attempt = async {
            let (done, result) = oneshot::channel();
            self.commands
                .send(LinkCommand::Ping { done })
                .await
                .map_err(|_| LinkError::Closed)?;
            result.await.map_err(|_| LinkError::Closed)?
        };

        tokio::time::timeout(wait, attempt)
            .await
            .map_err(|_| LinkError::Ping(format!("no completion within {:?}", wait)))?
    }

    /// Request a graceful close without waiting for it
    pub fn close(&self) {
        let _ = self.commands.try_send(LinkCommand::Close);
    }
}

/// Opens links to agents
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, url: &str) -> Result<Link, LinkError>;
}
