//! Typed builders for every event the gateway pushes to clients. Each
//! builder serializes its payload into the versioned wire envelope once,
//! so fan-out paths clone a ready string instead of re-serializing per
//! receiver.

mod connection;
mod envelope;
mod messaging;
mod presence;

pub(crate) use connection::{error, joined_chat, left_chat, ready};
pub(crate) use envelope::GatewayEvent;
pub(crate) use messaging::{message_read, receive_message};
pub(crate) use presence::{user_offline, user_online, user_stopped_typing, user_typing};
