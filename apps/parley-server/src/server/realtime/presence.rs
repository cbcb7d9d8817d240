use std::collections::HashMap;

use uuid::Uuid;

use crate::server::core::ConnectionPresence;

/// Whether removing this connection leaves the user with no other live
/// connection. The offline broadcast must fire exactly once per user,
/// so the check runs against the registry after the removal.
pub(crate) fn is_last_connection_of_user(
    presence: &HashMap<Uuid, ConnectionPresence>,
    user_id: &str,
) -> bool {
    !presence
        .values()
        .any(|connection| connection.user_id.to_string() == user_id)
}

/// First connection of a user triggers the online broadcast; later
/// devices attach silently.
pub(crate) fn is_first_connection_of_user(
    presence: &HashMap<Uuid, ConnectionPresence>,
    user_id: &str,
) -> bool {
    !presence
        .values()
        .any(|connection| connection.user_id.to_string() == user_id)
}
