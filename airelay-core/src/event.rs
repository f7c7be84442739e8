//! Event types on both sides of the relay.
//!
//! Contract:
//! - An `UpstreamEvent` is consumed immediately after delivery, never persisted.
//! - A downstream stream carries 0..n data frames, at most one error frame,
//!   and **exactly one** sentinel frame, always last.
//! - The sentinel is the literal `"[DONE]"`, used as both frame id and frame
//!   data. Error frames use id `"[ERROR]"` with a `RelayMessage` payload.

use serde::{Deserialize, Serialize};

/// End-of-stream marker. Clients of this stream depend on the literal value;
/// do not change it.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Frame id used for diagnostic error frames.
pub const ERROR_EVENT_ID: &str = "[ERROR]";

/// Reconnect hint attached to data and sentinel frames.
pub const DEFAULT_RECONNECT_MS: u64 = 3000;

/// One unit delivered by the upstream event source. Id and event type may be
/// absent; data may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
}

/// Downstream-normalized content wrapper. Serialized as `{"content": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayMessage {
    pub content: String,
}

impl RelayMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

/// Payload of a downstream frame: raw text for the sentinel, a
/// `RelayMessage` for data and error frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FramePayload {
    Raw(String),
    Message(RelayMessage),
}

impl FramePayload {
    /// Wire text written after `data:`. Raw payloads pass through untouched;
    /// messages are JSON-encoded.
    pub fn to_wire(&self) -> String {
        match self {
            Self::Raw(s) => s.clone(),
            // RelayMessage has no non-serializable fields, so encoding
            // cannot fail.
            Self::Message(m) => serde_json::to_string(m).unwrap_or_default(),
        }
    }
}

/// One frame emitted to the downstream client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEvent {
    pub id: String,
    pub data: FramePayload,
    pub reconnect_time_ms: Option<u64>,
}

impl OutboundEvent {
    /// A data frame carrying relayed content, with the reconnect hint.
    pub fn data(id: impl Into<String>, message: RelayMessage, reconnect_time_ms: u64) -> Self {
        Self {
            id: id.into(),
            data: FramePayload::Message(message),
            reconnect_time_ms: Some(reconnect_time_ms),
        }
    }

    /// The terminal frame: `[DONE]` as both id and data.
    pub fn sentinel(reconnect_time_ms: u64) -> Self {
        Self {
            id: DONE_SENTINEL.to_string(),
            data: FramePayload::Raw(DONE_SENTINEL.to_string()),
            reconnect_time_ms: Some(reconnect_time_ms),
        }
    }

    /// A diagnostic frame. No reconnect hint: the stream is ending, not
    /// reconnecting.
    pub fn error(message: RelayMessage) -> Self {
        Self {
            id: ERROR_EVENT_ID.to_string(),
            data: FramePayload::Message(message),
            reconnect_time_ms: None,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.id == DONE_SENTINEL
    }

    pub fn is_error(&self) -> bool {
        self.id == ERROR_EVENT_ID
    }

    /// SSE wire encoding: `id:` / `retry:` / `data:` lines, blank-line
    /// terminated.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        out.push_str("id: ");
        out.push_str(&self.id);
        out.push('\n');
        if let Some(ms) = self.reconnect_time_ms {
            out.push_str(&format!("retry: {ms}\n"));
        }
        out.push_str("data: ");
        out.push_str(&self.data.to_wire());
        out.push_str("\n\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_message_json_shape() {
        let m = RelayMessage::new("Hello");
        let json = serde_json::to_string(&m).unwrap();
        assert_eq!(json, r#"{"content":"Hello"}"#);
        let back: RelayMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn sentinel_frame_uses_literal_for_id_and_data() {
        let f = OutboundEvent::sentinel(DEFAULT_RECONNECT_MS);
        assert!(f.is_sentinel());
        assert_eq!(f.data.to_wire(), "[DONE]");
        assert_eq!(f.reconnect_time_ms, Some(3000));
    }

    #[test]
    fn error_frame_omits_reconnect_hint() {
        let f = OutboundEvent::error(RelayMessage::new("boom"));
        assert!(f.is_error());
        assert_eq!(f.reconnect_time_ms, None);
    }

    #[test]
    fn wire_encoding_data_frame() {
        let f = OutboundEvent::data("7", RelayMessage::new("hi"), 3000);
        let wire = f.to_wire();
        assert_eq!(wire, "id: 7\nretry: 3000\ndata: {\"content\":\"hi\"}\n\n");
    }

    #[test]
    fn wire_encoding_sentinel_frame() {
        let wire = OutboundEvent::sentinel(3000).to_wire();
        assert_eq!(wire, "id: [DONE]\nretry: 3000\ndata: [DONE]\n\n");
    }

    #[test]
    fn wire_encoding_error_frame_has_no_retry_line() {
        let wire = OutboundEvent::error(RelayMessage::new("bad")).to_wire();
        assert!(!wire.contains("retry:"));
        assert!(wire.starts_with("id: [ERROR]\n"));
    }
}
