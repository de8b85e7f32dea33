//! Trellis Core - replica model and presence
//!
//! This crate provides the session-local state of a Trellis client:
//! - Element tree and page list model with pure tree algorithms
//! - `DocumentSyncer`, which keeps that model in a Y.Doc
//! - `Awareness` and `AwarenessController` for cursors and selections

pub mod awareness;
pub mod element;
pub mod error;
pub mod syncer;

pub use awareness::{
    presence_color, Awareness, AwarenessConfig, AwarenessController, AwarenessState,
    CursorPosition, PresenceSnapshot, PresenceUpdate, RemotePresence, UserIdentity,
};
pub use element::{Element, Page};
pub use error::{Error, Result};
pub use syncer::{
    DocumentSyncer, ElementOperation, PageOperation, ReplicaChange, ReplicaOrigin, ReplicaSlice,
};
