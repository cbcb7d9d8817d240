use tokio::sync::mpsc;
use uuid::Uuid;

use crate::server::core::Subscriptions;

pub(crate) fn add_subscription(
    subscriptions: &mut Subscriptions,
    group_key: String,
    connection_id: Uuid,
    sender: mpsc::Sender<String>,
) {
    subscriptions
        .entry(group_key)
        .or_default()
        .insert(connection_id, sender);
}

pub(crate) fn remove_subscription(
    subscriptions: &mut Subscriptions,
    group_key: &str,
    connection_id: Uuid,
) {
    if let Some(group) = subscriptions.get_mut(group_key) {
        group.remove(&connection_id);
        if group.is_empty() {
            subscriptions.remove(group_key);
        }
    }
}

/// Drops a connection from every group it appears in. Empty groups are
/// pruned so the index never accumulates dead keys.
pub(crate) fn remove_connection(subscriptions: &mut Subscriptions, connection_id: Uuid) {
    for group in subscriptions.values_mut() {
        group.remove(&connection_id);
    }
    subscriptions.retain(|_, group| !group.is_empty());
}
