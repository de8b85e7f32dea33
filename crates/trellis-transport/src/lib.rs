//! Trellis Transport Layer
//!
//! Client-side plumbing between a session and the collaboration server:
//! - Connection: one reconnecting socket per session, with backoff
//! - Dispatcher: envelopes, request correlation, offline queue
//! - Sender: send-or-queue and flush on reconnect
//! - WebSocket: tokio-tungstenite connector (default feature)
//! - Mock: in-memory connector for tests
//! - Metrics: Prometheus metrics (optional feature)

pub mod connection;
pub mod dispatcher;
pub mod error;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod mock;
pub mod rate_limit;
pub mod sender;
pub mod socket;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use connection::{
    Backoff, BackoffPolicy, ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionState,
};
pub use dispatcher::{DispatcherConfig, MessageDispatcher, PendingResponse};
pub use error::{RequestError, TransportError, TransportResult};
#[cfg(feature = "metrics")]
pub use metrics::Metrics;
pub use mock::{MockConnector, MockListener, MockServer};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use sender::{MessageSender, SenderEvent, CONNECTION_CLOSED};
pub use socket::{Connector, Socket, SocketFrame, StaticToken, TokenProvider};
#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnector;
