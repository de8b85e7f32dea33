//! Connector seam between the connection state machine and a concrete socket

use crate::error::TransportError;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// One inbound event from an open socket
#[derive(Debug, Clone, PartialEq)]
pub enum SocketFrame {
    Text(String),
    /// Non-fatal socket error; a `Closed` frame follows if the socket dies
    Error(String),
    Closed { code: Option<u16>, reason: String },
}

/// An open socket, as a pair of channels.
///
/// Sending never blocks: it either hands the frame to the socket writer or
/// fails immediately because the writer is gone. Dropping the `Socket`
/// closes the connection.
#[derive(Debug)]
pub struct Socket {
    outgoing: mpsc::UnboundedSender<String>,
    incoming: mpsc::UnboundedReceiver<SocketFrame>,
}

impl Socket {
    pub fn new(
        outgoing: mpsc::UnboundedSender<String>,
        incoming: mpsc::UnboundedReceiver<SocketFrame>,
    ) -> Self {
        Self { outgoing, incoming }
    }

    pub fn into_parts(self) -> (mpsc::UnboundedSender<String>, mpsc::UnboundedReceiver<SocketFrame>) {
        (self.outgoing, self.incoming)
    }
}

/// Opens sockets
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Dial `url`; resolves once the socket is open
    async fn connect(&self, url: &str) -> Result<Socket, TransportError>;
}

/// Supplies the credential for each connection attempt.
///
/// Called again before every attempt so expired credentials can be refreshed.
#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    async fn token(&self) -> Result<String, TransportError>;
}

/// A credential that never changes
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<String, TransportError> {
        Ok(self.0.clone())
    }
}
