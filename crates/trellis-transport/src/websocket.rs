//! WebSocket connector on tokio-tungstenite

use crate::error::TransportError;
use crate::socket::{Connector, Socket, SocketFrame};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, warn};

/// Dials real WebSocket servers
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Socket, TransportError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<SocketFrame>();

        // Writer: ends when the owning Socket is dropped
        let writer_events = in_tx.clone();
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = write.send(Message::Text(text)).await {
                    error!(error = %e, "WebSocket write error");
                    let _ = writer_events.send(SocketFrame::Error(e.to_string()));
                    return;
                }
            }
            let _ = write.send(Message::Close(None)).await;
            debug!("WebSocket writer finished");
        });

        tokio::spawn(async move {
            loop {
                let frame = match read.next().await {
                    Some(Ok(Message::Text(text))) => SocketFrame::Text(text),
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (Some(u16::from(f.code)), f.reason.into_owned()))
                            .unwrap_or((None, String::new()));
                        let _ = in_tx.send(SocketFrame::Closed { code, reason });
                        return;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        warn!(len = data.len(), "Ignoring binary WebSocket frame");
                        continue;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        error!(error = %e, "WebSocket read error");
                        let _ = in_tx.send(SocketFrame::Error(e.to_string()));
                        let _ = in_tx.send(SocketFrame::Closed {
                            code: None,
                            reason: e.to_string(),
                        });
                        return;
                    }
                    None => {
                        let _ = in_tx.send(SocketFrame::Closed {
                            code: None,
                            reason: "stream ended".into(),
                        });
                        return;
                    }
                };
                if in_tx.send(frame).is_err() {
                    return;
                }
            }
        });

        Ok(Socket::new(out_tx, in_rx))
    }
}
