use std::collections::HashMap;

use crate::server::core::MembershipRecord;

/// Recipients of a delivery-status row for a new message: every active
/// member of the conversation except the sender. Soft-removed members
/// get nothing.
pub(crate) fn delivery_targets(
    members: &HashMap<String, MembershipRecord>,
    sender_id: &str,
) -> Vec<String> {
    let mut targets: Vec<String> = members
        .iter()
        .filter(|(member_id, membership)| membership.active && member_id.as_str() != sender_id)
        .map(|(member_id, _)| member_id.clone())
        .collect();
    targets.sort();
    targets
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use parley_core::{ConversationRole, UserId};

    use crate::server::core::MembershipRecord;

    use super::delivery_targets;

    fn membership(user_id: UserId, active: bool) -> MembershipRecord {
        MembershipRecord {
            user_id,
            role: ConversationRole::Member,
            active,
            joined_at_unix: 0,
            added_by: user_id,
            left_at_unix: None,
            muted: false,
            muted_until_unix: None,
            last_read_message_id: None,
            last_read_at_unix: None,
        }
    }

    #[test]
    fn three_member_group_yields_two_delivery_rows() {
        let sender = UserId::new();
        let second = UserId::new();
        let third = UserId::new();
        let members = HashMap::from([
            (sender.to_string(), membership(sender, true)),
            (second.to_string(), membership(second, true)),
            (third.to_string(), membership(third, true)),
        ]);

        let targets = delivery_targets(&members, &sender.to_string());
        assert_eq!(targets.len(), 2);
        assert!(!targets.contains(&sender.to_string()));
    }

    #[test]
    fn soft_removed_members_receive_no_delivery_row() {
        let sender = UserId::new();
        let departed = UserId::new();
        let members = HashMap::from([
            (sender.to_string(), membership(sender, true)),
            (departed.to_string(), membership(departed, false)),
        ]);

        assert!(delivery_targets(&members, &sender.to_string()).is_empty());
    }
}
