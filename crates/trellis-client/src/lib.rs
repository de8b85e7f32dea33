//! Trellis Client
//!
//! The session-level entry point. A [`Provider`] connects one user to one
//! page of a project and keeps a local replica of its element tree and page
//! list in step with the server, alongside everyone's cursors and
//! selections.
//!
//! ```no_run
//! # async fn run() {
//! use std::sync::Arc;
//! use trellis_client::{Provider, ProviderCallbacks, ProviderConfig};
//! use trellis_transport::{StaticToken, WebSocketConnector};
//!
//! let config = ProviderConfig::new("wss://collab.example.com", "proj", "home", "u1", "Ada");
//! let provider = Provider::new(
//!     config,
//!     yrs::Doc::new(),
//!     Arc::new(WebSocketConnector::new()),
//!     Arc::new(StaticToken("token".into())),
//!     ProviderCallbacks::default(),
//! );
//! provider.send_presence(10.0, 20.0, None);
//! # }
//! ```

pub mod config;
pub mod provider;

pub use config::{ConfigError, ProviderConfig};
pub use provider::{
    ErrorCallback, OperationAck, PresenceCallback, PresenceSubscription, Provider,
    ProviderCallbacks, ProviderStatus,
};
