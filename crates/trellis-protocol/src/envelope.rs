//! Wire envelope
//!
//! Every frame is one JSON object:
//! ```text
//! {type, projectId, pageId, userId?, requestId?, timestamp, payload}
//! ```
//! `requestId` is present exactly when a correlated response is expected.

use crate::error::{ProtocolError, ProtocolResult};
use crate::message::MessageType;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// Fallback message when a failed response carries no usable text
pub const GENERIC_FAILURE: &str = "Request failed";

/// Uniform wire-message wrapper
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<T = Value> {
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub page_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub timestamp: u64,
    /// Absent on some server error replies; reads as `null` then
    #[serde(default, bound(deserialize = "T: Deserialize<'de> + Default"))]
    pub payload: T,
    /// Top-level fields outside the envelope schema (servers put
    /// `message`, `error` or `code` here on failures)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl<T> Envelope<T> {
    /// Build an envelope stamped with the current time
    pub fn new(
        kind: MessageType,
        project_id: impl Into<String>,
        page_id: impl Into<String>,
        payload: T,
    ) -> Self {
        Self {
            kind,
            project_id: project_id.into(),
            page_id: page_id.into(),
            user_id: None,
            request_id: None,
            timestamp: now_millis(),
            payload,
            extra: Map::new(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

impl<T: Serialize> Envelope<T> {
    /// Erase the payload type
    pub fn into_value(self) -> ProtocolResult<Envelope<Value>> {
        let payload = serde_json::to_value(self.payload)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Envelope {
            kind: self.kind,
            project_id: self.project_id,
            page_id: self.page_id,
            user_id: self.user_id,
            request_id: self.request_id,
            timestamp: self.timestamp,
            payload,
            extra: self.extra,
        })
    }

    pub fn encode(&self) -> ProtocolResult<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

impl Envelope<Value> {
    /// Decode one text frame
    pub fn parse(frame: &str) -> ProtocolResult<Self> {
        let value: Value =
            serde_json::from_str(frame).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        if !value.is_object() {
            return Err(ProtocolError::InvalidEnvelope("frame is not a JSON object".into()));
        }
        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidEnvelope(e.to_string()))
    }

    /// Deserialize the payload into a typed message
    pub fn payload_as<P: DeserializeOwned>(&self) -> ProtocolResult<P> {
        P::deserialize(&self.payload).map_err(|e| ProtocolError::InvalidPayload {
            kind: self.kind.to_string(),
            message: e.to_string(),
        })
    }

    /// Whether this envelope reports success for a correlated request
    pub fn is_success(&self) -> bool {
        self.kind != MessageType::Error
            && self.payload.get("success").and_then(Value::as_bool) != Some(false)
    }

    /// Human-readable failure text, by priority:
    /// `payload.message`, `message`, `error`, `payload.code`, `code`.
    pub fn error_message(&self) -> String {
        let candidates = [
            self.payload.get("message"),
            self.extra.get("message"),
            self.extra.get("error"),
            self.payload.get("code"),
            self.extra.get("code"),
        ];
        candidates
            .into_iter()
            .flatten()
            .find_map(text_of)
            .unwrap_or_else(|| GENERIC_FAILURE.to_string())
    }
}

fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => obj.get("message").and_then(text_of),
        other => Some(other.to_string()),
    }
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DeleteElementPayload, ElementPayload};
    use serde_json::json;
    use trellis_core::Element;

    #[test]
    fn test_envelope_wire_shape() {
        let env = Envelope::new(
            MessageType::ElementDelete,
            "proj",
            "page",
            DeleteElementPayload {
                element_id: "e1".into(),
                deleted_children: vec![],
            },
        )
        .with_user("u1")
        .with_request_id("req-1-0");

        let value: Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "element:delete");
        assert_eq!(value["projectId"], "proj");
        assert_eq!(value["pageId"], "page");
        assert_eq!(value["userId"], "u1");
        assert_eq!(value["requestId"], "req-1-0");
        assert_eq!(value["payload"], json!({"elementId": "e1"}));
        assert!(value["timestamp"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_untracked_envelope_has_no_request_id() {
        let env = Envelope::new(MessageType::Presence, "p", "g", json!({})).encode().unwrap();
        assert!(!env.contains("requestId"));
    }

    #[test]
    fn test_parse_and_typed_payload() {
        let frame = r#"{"type":"element:create","requestId":"req-1","payload":{"element":{"id":"e1"}}}"#;
        let env = Envelope::parse(frame).unwrap();
        assert_eq!(env.kind, MessageType::ElementCreate);
        assert_eq!(env.request_id.as_deref(), Some("req-1"));
        assert!(env.is_success());

        let payload: ElementPayload = env.payload_as().unwrap();
        assert_eq!(payload.element, Element::new("e1", ""));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(Envelope::parse("{oops"), Err(ProtocolError::InvalidJson(_))));
        assert!(matches!(Envelope::parse("[1,2]"), Err(ProtocolError::InvalidEnvelope(_))));
        assert!(matches!(
            Envelope::parse(r#"{"payload":{}}"#),
            Err(ProtocolError::InvalidEnvelope(_))
        ));
    }

    #[test]
    fn test_typed_payload_mismatch() {
        let env = Envelope::parse(r#"{"type":"element:create","payload":{"nope":1}}"#).unwrap();
        assert!(matches!(
            env.payload_as::<ElementPayload>(),
            Err(ProtocolError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn test_success_flag() {
        let env = Envelope::parse(r#"{"type":"element:update","payload":{"success":false}}"#).unwrap();
        assert!(!env.is_success());
        let env = Envelope::parse(r#"{"type":"error","payload":{}}"#).unwrap();
        assert!(!env.is_success());
    }

    #[test]
    fn test_error_message_priority() {
        let parse = |v: Value| Envelope::parse(&v.to_string()).unwrap().error_message();

        assert_eq!(
            parse(json!({"type":"error","message":"top","error":"err","payload":{"message":"inner","code":"C"}})),
            "inner"
        );
        assert_eq!(
            parse(json!({"type":"error","message":"top","error":"err","payload":{"code":"C"}})),
            "top"
        );
        assert_eq!(parse(json!({"type":"error","error":"err","code":"X","payload":{"code":"C"}})), "err");
        assert_eq!(parse(json!({"type":"error","code":"X","payload":{"code":404}})), "404");
        assert_eq!(parse(json!({"type":"error","code":"X","payload":{}})), "X");
        assert_eq!(parse(json!({"type":"error","payload":null})), GENERIC_FAILURE);
    }

    #[test]
    fn test_error_without_payload() {
        let env =
            Envelope::parse(r#"{"type":"error","requestId":"req-1","message":"Element locked"}"#)
                .unwrap();
        assert_eq!(env.payload, Value::Null);
        assert_eq!(env.request_id.as_deref(), Some("req-1"));
        assert!(!env.is_success());
        assert_eq!(env.error_message(), "Element locked");
        assert!(env.extra.get("payload").is_none());
    }
}
