//! Trellis wire protocol
//!
//! JSON text frames exchanged with the collaboration server.
//!
//! ## Envelope
//! ```text
//! {"type": "<kind>", "projectId": "...", "pageId": "...",
//!  "userId": "...", "requestId": "...", "timestamp": <ms>, "payload": {...}}
//! ```
//!
//! ## Kinds
//! ```text
//! sync:page                      # full snapshot (request or response)
//! element:create|update|move|delete
//! page:create|update|delete
//! presence                       # cursor and selection of one user
//! user:leave                     # a peer went away
//! error                          # failure, correlated or not
//! ```

pub mod envelope;
pub mod error;
pub mod message;

pub use envelope::{now_millis, Envelope, GENERIC_FAILURE};
pub use error::{ProtocolError, ProtocolResult};
pub use message::{
    DeleteElementPayload, ElementPayload, MessageType, MoveElementPayload, OperationType,
    PagePayload, PresencePayload, SyncPagePayload, SyncRequestPayload, UserLeavePayload,
};
