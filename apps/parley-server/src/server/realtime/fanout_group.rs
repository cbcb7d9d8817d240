use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::server::core::Subscriptions;
use crate::server::metrics::{
    record_gateway_event_dropped, record_gateway_event_emitted, GATEWAY_DROP_REASON_OVERSIZED_OUTBOUND,
    GATEWAY_DROP_REASON_QUEUE_FULL,
};

/// Enqueues a pre-serialized payload to every connection subscribed to a
/// group, minus an optional excluded connection. Connections whose queue
/// is full are reported in `slow_connections` so the caller can force
/// them closed; closed queues are pruned in place.
pub(crate) fn dispatch_group_payload(
    subscriptions: &mut Subscriptions,
    group_key: &str,
    payload: &str,
    max_payload_bytes: usize,
    event_type: &'static str,
    exclude: &[Uuid],
    slow_connections: &mut Vec<Uuid>,
) -> usize {
    if payload.len() > max_payload_bytes {
        record_gateway_event_dropped("group", event_type, GATEWAY_DROP_REASON_OVERSIZED_OUTBOUND);
        warn!(
            event = "gateway.group_fanout.oversized_outbound",
            event_type,
            group_key,
            payload_bytes = payload.len(),
            max_payload_bytes,
        );
        return 0;
    }

    let Some(group) = subscriptions.get_mut(group_key) else {
        return 0;
    };

    let mut stale_connections = Vec::new();
    let mut delivered = 0usize;
    for (connection_id, sender) in group.iter() {
        if exclude.contains(connection_id) {
            continue;
        }
        match sender.try_send(payload.to_owned()) {
            Ok(()) => delivered += 1,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                record_gateway_event_dropped("group", event_type, "closed");
                stale_connections.push(*connection_id);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                record_gateway_event_dropped("group", event_type, GATEWAY_DROP_REASON_QUEUE_FULL);
                warn!(
                    event = "gateway.group_fanout.queue_full",
                    event_type,
                    group_key,
                    connection_id = %connection_id,
                );
                slow_connections.push(*connection_id);
                stale_connections.push(*connection_id);
            }
        }
    }

    for connection_id in stale_connections {
        group.remove(&connection_id);
    }
    if group.is_empty() {
        subscriptions.remove(group_key);
    }
    if delivered > 0 {
        record_gateway_event_emitted("group", event_type);
    }
    delivered
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokio::sync::mpsc;
    use uuid::Uuid;

    use crate::server::core::Subscriptions;

    use super::dispatch_group_payload;

    #[tokio::test]
    async fn delivers_to_every_subscriber_except_the_excluded_one() {
        let excluded_id = Uuid::new_v4();
        let other_id = Uuid::new_v4();
        let (excluded_sender, mut excluded_receiver) = mpsc::channel::<String>(2);
        let (other_sender, mut other_receiver) = mpsc::channel::<String>(2);

        let mut subscriptions: Subscriptions = HashMap::from([(
            String::from("conversation:c-1"),
            HashMap::from([(excluded_id, excluded_sender), (other_id, other_sender)]),
        )]);

        let mut slow_connections = Vec::new();
        let delivered = dispatch_group_payload(
            &mut subscriptions,
            "conversation:c-1",
            "payload",
            "payload".len(),
            "user_typing",
            &[excluded_id],
            &mut slow_connections,
        );

        assert_eq!(delivered, 1);
        assert!(slow_connections.is_empty());
        assert_eq!(other_receiver.recv().await.as_deref(), Some("payload"));
        assert!(excluded_receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn queue_full_marks_the_connection_slow_and_prunes_it() {
        let keep_id = Uuid::new_v4();
        let full_id = Uuid::new_v4();
        let closed_id = Uuid::new_v4();

        let (keep_sender, _keep_receiver) = mpsc::channel::<String>(2);
        let (full_sender, mut full_receiver) = mpsc::channel::<String>(1);
        full_sender
            .try_send(String::from("occupied"))
            .expect("queue should fill");
        let (closed_sender, closed_receiver) = mpsc::channel::<String>(1);
        drop(closed_receiver);

        let mut subscriptions: Subscriptions = HashMap::from([(
            String::from("conversation:c-1"),
            HashMap::from([
                (keep_id, keep_sender),
                (full_id, full_sender),
                (closed_id, closed_sender),
            ]),
        )]);

        let mut slow_connections = Vec::new();
        let delivered = dispatch_group_payload(
            &mut subscriptions,
            "conversation:c-1",
            "payload",
            "payload".len(),
            "receive_message",
            &[],
            &mut slow_connections,
        );

        assert_eq!(delivered, 1);
        assert_eq!(slow_connections, vec![full_id]);
        let group = subscriptions
            .get("conversation:c-1")
            .expect("group key should remain for the healthy listener");
        assert!(group.contains_key(&keep_id));
        assert!(!group.contains_key(&full_id));
        assert!(!group.contains_key(&closed_id));
        assert_eq!(full_receiver.recv().await.as_deref(), Some("occupied"));
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected_before_any_enqueue() {
        let connection_id = Uuid::new_v4();
        let (sender, mut receiver) = mpsc::channel::<String>(1);
        let mut subscriptions: Subscriptions = HashMap::from([(
            String::from("conversation:c-1"),
            HashMap::from([(connection_id, sender)]),
        )]);

        let mut slow_connections = Vec::new();
        let payload = "payload";
        let delivered = dispatch_group_payload(
            &mut subscriptions,
            "conversation:c-1",
            payload,
            payload.len() - 1,
            "receive_message",
            &[],
            &mut slow_connections,
        );

        assert_eq!(delivered, 0);
        assert!(slow_connections.is_empty());
        assert!(receiver.try_recv().is_err());
        assert!(subscriptions.contains_key("conversation:c-1"));
    }
}
