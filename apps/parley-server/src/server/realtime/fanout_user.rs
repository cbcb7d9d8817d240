use std::collections::HashMap;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::server::core::ConnectionPresence;
use crate::server::metrics::{
    record_gateway_event_dropped, record_gateway_event_emitted, GATEWAY_DROP_REASON_OVERSIZED_OUTBOUND,
    GATEWAY_DROP_REASON_QUEUE_FULL,
};

/// Live connection ids belonging to a user, across all their devices.
pub(crate) fn user_connection_ids(
    presence: &HashMap<Uuid, ConnectionPresence>,
    user_id: &str,
) -> Vec<Uuid> {
    presence
        .iter()
        .filter(|(_, connection)| connection.user_id.to_string() == user_id)
        .map(|(connection_id, _)| *connection_id)
        .collect()
}

/// Enqueues a payload directly to specific connections, bypassing the
/// group index. Used for events addressed to one user, like read
/// receipts back to a message's sender.
pub(crate) fn dispatch_user_payload(
    senders: &mut HashMap<Uuid, mpsc::Sender<String>>,
    connection_ids: &[Uuid],
    payload: &str,
    max_payload_bytes: usize,
    event_type: &'static str,
    slow_connections: &mut Vec<Uuid>,
) -> usize {
    if payload.len() > max_payload_bytes {
        record_gateway_event_dropped("user", event_type, GATEWAY_DROP_REASON_OVERSIZED_OUTBOUND);
        return 0;
    }

    let mut delivered = 0usize;
    for connection_id in connection_ids {
        let Some(sender) = senders.get(connection_id) else {
            continue;
        };
        match sender.try_send(payload.to_owned()) {
            Ok(()) => delivered += 1,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                record_gateway_event_dropped("user", event_type, "closed");
                senders.remove(connection_id);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                record_gateway_event_dropped("user", event_type, GATEWAY_DROP_REASON_QUEUE_FULL);
                slow_connections.push(*connection_id);
                senders.remove(connection_id);
            }
        }
    }

    if delivered > 0 {
        record_gateway_event_emitted("user", event_type);
    }
    delivered
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use parley_core::UserId;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use crate::server::core::ConnectionPresence;

    use super::{dispatch_user_payload, user_connection_ids};

    #[test]
    fn connection_lookup_finds_every_device_of_a_user() {
        let target = UserId::new();
        let other = UserId::new();
        let phone = Uuid::new_v4();
        let laptop = Uuid::new_v4();
        let unrelated = Uuid::new_v4();

        let presence = HashMap::from([
            (
                phone,
                ConnectionPresence {
                    user_id: target,
                    conversation_ids: HashSet::new(),
                },
            ),
            (
                laptop,
                ConnectionPresence {
                    user_id: target,
                    conversation_ids: HashSet::new(),
                },
            ),
            (
                unrelated,
                ConnectionPresence {
                    user_id: other,
                    conversation_ids: HashSet::new(),
                },
            ),
        ]);

        let mut found = user_connection_ids(&presence, &target.to_string());
        found.sort();
        let mut expected = vec![phone, laptop];
        expected.sort();
        assert_eq!(found, expected);
    }

    #[tokio::test]
    async fn delivers_to_each_named_connection() {
        let first_id = Uuid::new_v4();
        let second_id = Uuid::new_v4();
        let gone_id = Uuid::new_v4();

        let (first_sender, mut first_receiver) = mpsc::channel::<String>(1);
        let (second_sender, mut second_receiver) = mpsc::channel::<String>(1);
        let mut senders = HashMap::from([(first_id, first_sender), (second_id, second_sender)]);

        let mut slow_connections = Vec::new();
        let delivered = dispatch_user_payload(
            &mut senders,
            &[first_id, gone_id, second_id],
            "payload",
            "payload".len(),
            "message_read",
            &mut slow_connections,
        );

        assert_eq!(delivered, 2);
        assert!(slow_connections.is_empty());
        assert_eq!(first_receiver.recv().await.as_deref(), Some("payload"));
        assert_eq!(second_receiver.recv().await.as_deref(), Some("payload"));
    }

    #[tokio::test]
    async fn full_queues_are_marked_slow_and_dropped_from_the_registry() {
        let full_id = Uuid::new_v4();
        let (full_sender, mut full_receiver) = mpsc::channel::<String>(1);
        full_sender
            .try_send(String::from("occupied"))
            .expect("queue should fill");
        let mut senders = HashMap::from([(full_id, full_sender)]);

        let mut slow_connections = Vec::new();
        let delivered = dispatch_user_payload(
            &mut senders,
            &[full_id],
            "payload",
            "payload".len(),
            "message_read",
            &mut slow_connections,
        );

        assert_eq!(delivered, 0);
        assert_eq!(slow_connections, vec![full_id]);
        assert!(senders.is_empty());
        assert_eq!(full_receiver.recv().await.as_deref(), Some("occupied"));
    }
}
