use parley_core::UserId;
use parley_protocol::server_events;
use serde::Serialize;

use super::{envelope::build_event, GatewayEvent};

#[derive(Serialize)]
struct ReadyPayload {
    user_id: String,
    conversation_ids: Vec<String>,
}

#[derive(Serialize)]
struct ChatScopePayload<'a> {
    conversation_id: &'a str,
    user_id: String,
}

#[derive(Serialize)]
struct ErrorPayload<'a> {
    code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    op: Option<&'a str>,
}

pub(crate) fn ready(user_id: UserId, conversation_ids: Vec<String>) -> GatewayEvent {
    build_event(
        server_events::READY,
        ReadyPayload {
            user_id: user_id.to_string(),
            conversation_ids,
        },
    )
}

pub(crate) fn joined_chat(conversation_id: &str, user_id: UserId) -> GatewayEvent {
    build_event(
        server_events::JOINED_CHAT,
        ChatScopePayload {
            conversation_id,
            user_id: user_id.to_string(),
        },
    )
}

pub(crate) fn left_chat(conversation_id: &str, user_id: UserId) -> GatewayEvent {
    build_event(
        server_events::LEFT_CHAT,
        ChatScopePayload {
            conversation_id,
            user_id: user_id.to_string(),
        },
    )
}

/// Delivered only to the connection that issued the failing op.
pub(crate) fn error(code: &'static str, op: Option<&str>) -> GatewayEvent {
    build_event(server_events::ERROR, ErrorPayload { code, op })
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    fn parse_payload(event: &GatewayEvent) -> Value {
        let value: Value =
            serde_json::from_str(&event.payload).expect("gateway event payload should be valid");
        assert_eq!(value["t"], Value::from(event.event_type));
        value["d"].clone()
    }

    #[test]
    fn ready_event_lists_subscribed_conversations() {
        let user_id = UserId::new();
        let payload = parse_payload(&ready(user_id, vec![String::from("conv-1")]));
        assert_eq!(payload["user_id"], Value::from(user_id.to_string()));
        assert_eq!(payload["conversation_ids"][0], Value::from("conv-1"));
    }

    #[test]
    fn error_event_carries_code_and_offending_op() {
        let payload = parse_payload(&error("forbidden", Some("send_message")));
        assert_eq!(payload["code"], Value::from("forbidden"));
        assert_eq!(payload["op"], Value::from("send_message"));
    }

    #[test]
    fn error_event_omits_op_when_unknown() {
        let payload = parse_payload(&error("invalid_request", None));
        assert!(payload.get("op").is_none());
    }
}
