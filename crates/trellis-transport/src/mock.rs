//! In-memory connector for testing.
//!
//! Every successful `connect` hands a [`MockServer`] to the paired
//! [`MockListener`], which plays the server side of that socket.

use crate::error::TransportError;
use crate::socket::{Connector, Socket, SocketFrame};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use trellis_protocol::Envelope;

#[derive(Debug)]
enum Plan {
    Fail(String),
    Hang,
}

#[derive(Debug, Default)]
struct MockConnectorInner {
    urls: Vec<String>,
    plans: VecDeque<Plan>,
}

/// Mock connector.
///
/// Records dialed URLs and can be told to fail or hang upcoming attempts.
#[derive(Debug, Clone)]
pub struct MockConnector {
    inner: Arc<Mutex<MockConnectorInner>>,
    accepted: mpsc::UnboundedSender<MockServer>,
}

/// Receives the server side of each accepted socket
#[derive(Debug)]
pub struct MockListener {
    accepted: mpsc::UnboundedReceiver<MockServer>,
}

impl MockConnector {
    pub fn new() -> (Self, MockListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            inner: Arc::new(Mutex::new(MockConnectorInner::default())),
            accepted: tx,
        };
        (connector, MockListener { accepted: rx })
    }

    /// Make the next pending attempt fail with `error`
    pub fn fail_next_connect(&self, error: &str) {
        self.inner.lock().plans.push_back(Plan::Fail(error.to_string()));
    }

    /// Make the next pending attempt never complete
    pub fn hang_next_connect(&self) {
        self.inner.lock().plans.push_back(Plan::Hang);
    }

    /// Every URL dialed so far, in order
    pub fn urls(&self) -> Vec<String> {
        self.inner.lock().urls.clone()
    }

    pub fn attempts(&self) -> usize {
        self.inner.lock().urls.len()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<Socket, TransportError> {
        let plan = {
            let mut inner = self.inner.lock();
            inner.urls.push(url.to_string());
            inner.plans.pop_front()
        };
        match plan {
            Some(Plan::Fail(error)) => return Err(TransportError::ConnectionFailed(error)),
            Some(Plan::Hang) => std::future::pending::<()>().await,
            None => {}
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let server = MockServer {
            url: url.to_string(),
            to_client: in_tx,
            from_client: out_rx,
        };
        self.accepted
            .send(server)
            .map_err(|_| TransportError::ConnectionFailed("listener dropped".into()))?;
        Ok(Socket::new(out_tx, in_rx))
    }
}

impl MockListener {
    /// Wait for the next accepted socket
    pub async fn accept(&mut self) -> Option<MockServer> {
        self.accepted.recv().await
    }

    pub fn try_accept(&mut self) -> Option<MockServer> {
        self.accepted.try_recv().ok()
    }
}

/// Server side of one mock socket.
///
/// Dropping it without [`MockServer::close`] leaves the client connected but
/// unable to send.
#[derive(Debug)]
pub struct MockServer {
    url: String,
    to_client: mpsc::UnboundedSender<SocketFrame>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl MockServer {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Deliver a text frame to the client
    pub fn send(&self, text: impl Into<String>) -> bool {
        self.to_client.send(SocketFrame::Text(text.into())).is_ok()
    }

    pub fn send_json(&self, value: &Value) -> bool {
        self.send(value.to_string())
    }

    /// Report a socket error without closing
    pub fn error(&self, message: &str) -> bool {
        self.to_client.send(SocketFrame::Error(message.to_string())).is_ok()
    }

    /// Close from the server side; later client sends fail
    pub fn close(self, code: u16, reason: &str) {
        let _ = self.to_client.send(SocketFrame::Closed {
            code: Some(code),
            reason: reason.to_string(),
        });
    }

    /// Next frame sent by the client, `None` once the client hung up
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    pub fn try_recv(&mut self) -> Option<String> {
        self.from_client.try_recv().ok()
    }

    /// Next client frame decoded as an envelope
    pub async fn recv_envelope(&mut self) -> Option<Envelope<Value>> {
        let text = self.recv().await?;
        Envelope::parse(&text).ok()
    }

    /// Every frame the client has sent and not yet been read
    pub fn drain(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(text) = self.from_client.try_recv() {
            frames.push(text);
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_socket_pair() {
        let (connector, mut listener) = MockConnector::new();
        let socket = connector.connect("ws://mock/ws/p").await.unwrap();
        let mut server = listener.accept().await.unwrap();
        assert_eq!(server.url(), "ws://mock/ws/p");

        let (out, mut incoming) = socket.into_parts();
        out.send("hello".into()).unwrap();
        assert_eq!(server.recv().await.as_deref(), Some("hello"));

        server.send("world");
        assert_eq!(incoming.recv().await, Some(SocketFrame::Text("world".into())));

        server.close(4000, "bye");
        assert_eq!(
            incoming.recv().await,
            Some(SocketFrame::Closed { code: Some(4000), reason: "bye".into() })
        );
        assert!(out.send("late".into()).is_err());
    }

    #[tokio::test]
    async fn test_mock_scripted_failure() {
        let (connector, _listener) = MockConnector::new();
        connector.fail_next_connect("refused");
        let err = connector.connect("ws://mock").await.unwrap_err();
        assert_eq!(err, TransportError::ConnectionFailed("refused".into()));
        assert_eq!(connector.attempts(), 1);
        assert!(connector.connect("ws://mock").await.is_ok());
    }
}
