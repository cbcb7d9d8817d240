use parley_core::UserId;
use parley_protocol::server_events;
use serde::Serialize;

use super::{envelope::build_event, GatewayEvent};

#[derive(Serialize)]
struct PresencePayload {
    user_id: String,
    at_unix: i64,
}

#[derive(Serialize)]
struct TypingPayload<'a> {
    conversation_id: &'a str,
    user_id: String,
}

pub(crate) fn user_online(user_id: UserId, at_unix: i64) -> GatewayEvent {
    build_event(
        server_events::USER_ONLINE,
        PresencePayload {
            user_id: user_id.to_string(),
            at_unix,
        },
    )
}

/// Emitted once per user, when the last live connection goes away.
pub(crate) fn user_offline(user_id: UserId, at_unix: i64) -> GatewayEvent {
    build_event(
        server_events::USER_OFFLINE,
        PresencePayload {
            user_id: user_id.to_string(),
            at_unix,
        },
    )
}

pub(crate) fn user_typing(conversation_id: &str, user_id: UserId) -> GatewayEvent {
    build_event(
        server_events::USER_TYPING,
        TypingPayload {
            conversation_id,
            user_id: user_id.to_string(),
        },
    )
}

pub(crate) fn user_stopped_typing(conversation_id: &str, user_id: UserId) -> GatewayEvent {
    build_event(
        server_events::USER_STOPPED_TYPING,
        TypingPayload {
            conversation_id,
            user_id: user_id.to_string(),
        },
    )
}
