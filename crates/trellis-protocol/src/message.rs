//! Message types and payloads

use serde::{Deserialize, Serialize};
use serde_json::Value;
use trellis_core::{Element, Page, PresenceUpdate};

/// Envelope `type` field
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    /// Full page state (request when sent, snapshot when received)
    SyncPage,
    ElementCreate,
    ElementUpdate,
    ElementMove,
    ElementDelete,
    PageCreate,
    PageUpdate,
    PageDelete,
    Presence,
    UserLeave,
    Error,
    /// Anything this client does not route
    Other(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::SyncPage => "sync:page",
            MessageType::ElementCreate => "element:create",
            MessageType::ElementUpdate => "element:update",
            MessageType::ElementMove => "element:move",
            MessageType::ElementDelete => "element:delete",
            MessageType::PageCreate => "page:create",
            MessageType::PageUpdate => "page:update",
            MessageType::PageDelete => "page:delete",
            MessageType::Presence => "presence",
            MessageType::UserLeave => "user:leave",
            MessageType::Error => "error",
            MessageType::Other(s) => s,
        }
    }

    pub fn is_element_operation(&self) -> bool {
        matches!(
            self,
            MessageType::ElementCreate
                | MessageType::ElementUpdate
                | MessageType::ElementMove
                | MessageType::ElementDelete
        )
    }
}

impl From<String> for MessageType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "sync:page" => MessageType::SyncPage,
            "element:create" => MessageType::ElementCreate,
            "element:update" => MessageType::ElementUpdate,
            "element:move" => MessageType::ElementMove,
            "element:delete" => MessageType::ElementDelete,
            "page:create" => MessageType::PageCreate,
            "page:update" => MessageType::PageUpdate,
            "page:delete" => MessageType::PageDelete,
            "presence" => MessageType::Presence,
            "user:leave" => MessageType::UserLeave,
            "error" => MessageType::Error,
            _ => MessageType::Other(s),
        }
    }
}

impl From<&str> for MessageType {
    fn from(s: &str) -> Self {
        MessageType::from(s.to_string())
    }
}

impl From<MessageType> for String {
    fn from(t: MessageType) -> Self {
        t.as_str().to_string()
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of structural mutation, as reported back to mutation callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Move,
    Delete,
}

impl OperationType {
    pub fn message_type(&self) -> MessageType {
        match self {
            OperationType::Create => MessageType::ElementCreate,
            OperationType::Update => MessageType::ElementUpdate,
            OperationType::Move => MessageType::ElementMove,
            OperationType::Delete => MessageType::ElementDelete,
        }
    }
}

/// `element:create` and `element:update`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementPayload {
    pub element: Element,
}

/// `element:delete`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteElementPayload {
    pub element_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deleted_children: Vec<String>,
}

/// `element:move`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveElementPayload {
    pub element_id: String,
    #[serde(default)]
    pub new_parent_id: Option<String>,
    #[serde(default)]
    pub new_order: i64,
}

/// `presence`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub cursor_x: f64,
    #[serde(default)]
    pub cursor_y: f64,
    #[serde(default)]
    pub element_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl PresencePayload {
    /// Resolve the sender (envelope `userId` first, then payload) into a
    /// presence update. `None` when no sender can be identified.
    pub fn into_update(self, sender: Option<&str>) -> Option<PresenceUpdate> {
        let user_id = sender
            .map(str::to_string)
            .or(self.user_id)
            .filter(|id| !id.is_empty())?;
        Some(PresenceUpdate {
            user_id,
            user_name: self.user_name,
            cursor_x: self.cursor_x,
            cursor_y: self.cursor_y,
            element_id: self.element_id,
            meta: self.meta,
        })
    }
}

/// `sync:page` response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncPagePayload {
    #[serde(default)]
    pub elements: Vec<Element>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pages: Option<Vec<Page>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users: Option<Vec<PresenceUpdate>>,
}

/// `sync:page` request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncRequestPayload {}

/// `user:leave`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserLeavePayload {
    pub user_id: String,
}

/// `page:create`, `page:update` and `page:delete`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PagePayload {
    #[serde(default)]
    pub page: Option<Page>,
    #[serde(default)]
    pub page_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_strings() {
        for kind in ["sync:page", "element:move", "presence", "user:leave", "error"] {
            assert_eq!(MessageType::from(kind).as_str(), kind);
        }
        assert_eq!(
            MessageType::from("cursor:ping"),
            MessageType::Other("cursor:ping".into())
        );
        assert!(MessageType::ElementDelete.is_element_operation());
        assert!(!MessageType::Presence.is_element_operation());
    }

    #[test]
    fn test_presence_sender_resolution() {
        let payload: PresencePayload =
            serde_json::from_str(r#"{"userId":"p","userName":"Pat","cursorX":4,"cursorY":2}"#).unwrap();

        let update = payload.clone().into_update(Some("env")).unwrap();
        assert_eq!(update.user_id, "env");
        assert_eq!(update.cursor_x, 4.0);

        assert_eq!(payload.clone().into_update(None).unwrap().user_id, "p");

        let anonymous = PresencePayload { user_id: None, ..payload };
        assert!(anonymous.into_update(None).is_none());
    }

    #[test]
    fn test_move_payload_null_parent() {
        let payload: MoveElementPayload =
            serde_json::from_str(r#"{"elementId":"e1","newParentId":null,"newOrder":3}"#).unwrap();
        assert_eq!(payload.new_parent_id, None);
        assert_eq!(payload.new_order, 3);
    }

    #[test]
    fn test_sync_roster_entry_without_user_id() {
        let payload: SyncPagePayload = serde_json::from_str(
            r#"{"elements":[{"id":"e1","type":"text"}],
                "users":[{"userName":"Ghost"},{"userId":"u2","userName":"Bo","cursorX":1}]}"#,
        )
        .unwrap();
        assert_eq!(payload.elements.len(), 1);

        let users = payload.users.unwrap();
        assert_eq!(users[0].user_id, "");
        assert_eq!(users[1].user_id, "u2");
    }
}
