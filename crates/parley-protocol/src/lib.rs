#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

/// Current gateway envelope version.
pub const PROTOCOL_VERSION: u16 = 1;
/// Maximum allowed gateway payload bytes.
pub const MAX_EVENT_BYTES: usize = 64 * 1024;

/// Client-initiated operation names the hub dispatches on.
pub mod client_ops {
    pub const SEND_MESSAGE: &str = "send_message";
    pub const JOIN_CHAT: &str = "join_chat";
    pub const LEAVE_CHAT: &str = "leave_chat";
    pub const MARK_READ: &str = "mark_read";
    pub const START_TYPING: &str = "start_typing";
    pub const STOP_TYPING: &str = "stop_typing";

    pub const ALL: &[&str] = &[
        SEND_MESSAGE,
        JOIN_CHAT,
        LEAVE_CHAT,
        MARK_READ,
        START_TYPING,
        STOP_TYPING,
    ];
}

/// Server-initiated event names clients subscribe to.
pub mod server_events {
    pub const READY: &str = "ready";
    pub const JOINED_CHAT: &str = "joined_chat";
    pub const LEFT_CHAT: &str = "left_chat";
    pub const RECEIVE_MESSAGE: &str = "receive_message";
    pub const USER_TYPING: &str = "user_typing";
    pub const USER_STOPPED_TYPING: &str = "user_stopped_typing";
    pub const USER_ONLINE: &str = "user_online";
    pub const USER_OFFLINE: &str = "user_offline";
    pub const MESSAGE_READ: &str = "message_read";
    pub const ERROR: &str = "error";
}

/// Versioned gateway envelope. All events use `{ v, t, d }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope<T> {
    pub v: u16,
    pub t: EventType,
    pub d: T,
}

/// Event type identifier with a strict character allowlist.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventType(String);

impl EventType {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this names an operation clients may initiate.
    #[must_use]
    pub fn is_client_op(&self) -> bool {
        client_ops::ALL.contains(&self.0.as_str())
    }
}

impl TryFrom<String> for EventType {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_event_type(&value)?;
        Ok(Self(value))
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.0
    }
}

/// Parse and validate an incoming envelope at the network boundary.
///
/// # Errors
/// Returns [`ProtocolError`] if the payload exceeds limits, is malformed JSON,
/// carries an unsupported version, or has an invalid event type.
pub fn parse_envelope(input: &[u8]) -> Result<Envelope<serde_json::Value>, ProtocolError> {
    if input.len() > MAX_EVENT_BYTES {
        return Err(ProtocolError::OversizedPayload {
            max: MAX_EVENT_BYTES,
            actual: input.len(),
        });
    }

    let envelope: Envelope<serde_json::Value> = serde_json::from_slice(input)?;
    if envelope.v != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion {
            expected: PROTOCOL_VERSION,
            actual: envelope.v,
        });
    }

    Ok(envelope)
}

fn validate_event_type(value: &str) -> Result<(), ProtocolError> {
    const MAX_LEN: usize = 64;

    if value.is_empty() || value.len() > MAX_LEN {
        return Err(ProtocolError::InvalidEventType);
    }

    if value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '.')
    {
        return Ok(());
    }

    Err(ProtocolError::InvalidEventType)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("payload exceeds max size: max={max} bytes actual={actual} bytes")]
    OversizedPayload { max: usize, actual: usize },
    #[error("unsupported envelope version: expected={expected} actual={actual}")]
    UnsupportedVersion { expected: u16, actual: u16 },
    #[error("invalid event type")]
    InvalidEventType,
    #[error("invalid json payload")]
    InvalidJson,
}

impl From<serde_json::Error> for ProtocolError {
    fn from(_: serde_json::Error) -> Self {
        Self::InvalidJson
    }
}

#[cfg(test)]
mod tests {
    use super::{
        client_ops, parse_envelope, EventType, ProtocolError, MAX_EVENT_BYTES, PROTOCOL_VERSION,
    };

    #[test]
    fn event_type_accepts_valid_identifier() {
        let event_type = EventType::try_from(String::from("send_message")).unwrap();
        assert_eq!(event_type.as_str(), "send_message");
        assert!(event_type.is_client_op());
    }

    #[test]
    fn event_type_rejects_invalid_identifier() {
        let error = EventType::try_from(String::from("Send-Message")).unwrap_err();
        assert_eq!(error, ProtocolError::InvalidEventType);
    }

    #[test]
    fn well_formed_unknown_names_are_not_client_ops() {
        let event_type = EventType::try_from(String::from("delete_everything")).unwrap();
        assert!(!event_type.is_client_op());
        for op in client_ops::ALL {
            let parsed = EventType::try_from((*op).to_owned()).unwrap();
            assert!(parsed.is_client_op());
        }
    }

    #[test]
    fn parse_rejects_unsupported_version() {
        let payload = br#"{"v":99,"t":"mark_read","d":{}}"#;
        let error = parse_envelope(payload).unwrap_err();
        assert_eq!(
            error,
            ProtocolError::UnsupportedVersion {
                expected: PROTOCOL_VERSION,
                actual: 99,
            }
        );
    }

    #[test]
    fn parse_rejects_unknown_fields() {
        let payload = br#"{"v":1,"t":"mark_read","d":{},"extra":1}"#;
        let error = parse_envelope(payload).unwrap_err();
        assert_eq!(error, ProtocolError::InvalidJson);
    }

    #[test]
    fn parse_rejects_oversized_payload() {
        let mut payload = Vec::from(&br#"{"v":1,"t":"send_message","d":{"content":""#[..]);
        payload.extend(std::iter::repeat_n(b'a', MAX_EVENT_BYTES));
        payload.extend_from_slice(br#""}}"#);
        let error = parse_envelope(&payload).unwrap_err();
        assert!(matches!(error, ProtocolError::OversizedPayload { .. }));
    }

    #[test]
    fn parse_accepts_valid_payload() {
        let payload = br#"{"v":1,"t":"start_typing","d":{"conversation_id":"abc"}}"#;
        let envelope = parse_envelope(payload).unwrap();

        assert_eq!(envelope.v, 1);
        assert_eq!(envelope.t.as_str(), "start_typing");
        assert_eq!(envelope.d["conversation_id"], "abc");
    }
}
