use serde::Serialize;

use crate::server::auth::outbound_event;

/// A server event serialized once, ready to be queued to any number of
/// connections.
pub(crate) struct GatewayEvent {
    pub(crate) event_type: &'static str,
    pub(crate) payload: String,
}

pub(super) fn build_event<T: Serialize>(event_type: &'static str, payload: T) -> GatewayEvent {
    GatewayEvent {
        event_type,
        payload: outbound_event(event_type, payload),
    }
}
