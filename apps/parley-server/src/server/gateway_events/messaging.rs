use parley_core::MessageKind;
use parley_protocol::server_events;
use serde::Serialize;

use super::{envelope::build_event, GatewayEvent};
use crate::server::core::MessageRecord;

#[derive(Serialize)]
struct ReceiveMessagePayload<'a> {
    conversation_id: &'a str,
    message_id: &'a str,
    sender_id: String,
    kind: MessageKind,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to_message_id: Option<&'a str>,
    created_at_unix: i64,
}

#[derive(Serialize)]
struct MessageReadPayload<'a> {
    conversation_id: &'a str,
    message_id: &'a str,
    reader_id: String,
    read_at_unix: i64,
}

pub(crate) fn receive_message(conversation_id: &str, message: &MessageRecord) -> GatewayEvent {
    build_event(
        server_events::RECEIVE_MESSAGE,
        ReceiveMessagePayload {
            conversation_id,
            message_id: &message.id,
            sender_id: message.sender_id.to_string(),
            kind: message.kind,
            content: &message.content,
            reply_to_message_id: message.reply_to_message_id.as_deref(),
            created_at_unix: message.created_at_unix,
        },
    )
}

/// Addressed to the sender's connections only; the reader already knows.
pub(crate) fn message_read(
    conversation_id: &str,
    message_id: &str,
    reader_id: parley_core::UserId,
    read_at_unix: i64,
) -> GatewayEvent {
    build_event(
        server_events::MESSAGE_READ,
        MessageReadPayload {
            conversation_id,
            message_id,
            reader_id: reader_id.to_string(),
            read_at_unix,
        },
    )
}
