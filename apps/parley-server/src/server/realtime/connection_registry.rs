use std::collections::HashMap;

use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::server::core::{ConnectionControl, ConnectionPresence};

pub(crate) fn remove_connection_state(
    presence: &mut HashMap<Uuid, ConnectionPresence>,
    controls: &mut HashMap<Uuid, watch::Sender<ConnectionControl>>,
    senders: &mut HashMap<Uuid, mpsc::Sender<String>>,
    connection_id: Uuid,
) -> Option<ConnectionPresence> {
    let removed_presence = presence.remove(&connection_id);
    controls.remove(&connection_id);
    senders.remove(&connection_id);
    removed_presence
}

/// Flips the watch channel of each listed connection to `Close`. The
/// connection's own tasks observe the flip and tear the socket down.
pub(crate) fn force_close_connections(
    controls: &HashMap<Uuid, watch::Sender<ConnectionControl>>,
    connection_ids: &[Uuid],
) {
    for connection_id in connection_ids {
        if let Some(control) = controls.get(connection_id) {
            let _ = control.send(ConnectionControl::Close);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use parley_core::UserId;
    use tokio::sync::{mpsc, watch};
    use uuid::Uuid;

    use super::{force_close_connections, remove_connection_state};
    use crate::server::core::{ConnectionControl, ConnectionPresence};

    #[test]
    fn removal_clears_presence_control_and_sender_entries() {
        let connection_id = Uuid::new_v4();
        let user_id = UserId::new();
        let mut presence = HashMap::from([(
            connection_id,
            ConnectionPresence {
                user_id,
                conversation_ids: HashSet::new(),
            },
        )]);
        let (control_tx, _control_rx) = watch::channel(ConnectionControl::Open);
        let mut controls = HashMap::from([(connection_id, control_tx)]);
        let (sender_tx, _sender_rx) = mpsc::channel::<String>(1);
        let mut senders = HashMap::from([(connection_id, sender_tx)]);

        let removed =
            remove_connection_state(&mut presence, &mut controls, &mut senders, connection_id);

        assert_eq!(
            removed.expect("presence should be removed").user_id,
            user_id
        );
        assert!(presence.is_empty());
        assert!(controls.is_empty());
        assert!(senders.is_empty());
    }

    #[test]
    fn missing_presence_still_prunes_the_other_maps() {
        let connection_id = Uuid::new_v4();
        let (control_tx, _control_rx) = watch::channel(ConnectionControl::Open);
        let mut controls = HashMap::from([(connection_id, control_tx)]);
        let (sender_tx, _sender_rx) = mpsc::channel::<String>(1);
        let mut senders = HashMap::from([(connection_id, sender_tx)]);

        let removed = remove_connection_state(
            &mut HashMap::new(),
            &mut controls,
            &mut senders,
            connection_id,
        );

        assert!(removed.is_none());
        assert!(controls.is_empty());
        assert!(senders.is_empty());
    }

    #[test]
    fn force_close_flips_only_the_named_connections() {
        let slow_id = Uuid::new_v4();
        let healthy_id = Uuid::new_v4();
        let (slow_tx, slow_rx) = watch::channel(ConnectionControl::Open);
        let (healthy_tx, healthy_rx) = watch::channel(ConnectionControl::Open);
        let controls = HashMap::from([(slow_id, slow_tx), (healthy_id, healthy_tx)]);

        force_close_connections(&controls, &[slow_id]);

        assert_eq!(*slow_rx.borrow(), ConnectionControl::Close);
        assert_eq!(*healthy_rx.borrow(), ConnectionControl::Open);
    }
}
