use parley_core::{
    permissions::{ConversationPermissionSet, MembershipSnapshot, SystemPermissionSet},
    ConversationKind, ConversationRole, DeliveryState, UserId,
};

use super::{
    auth::now_unix,
    core::{
        AppState, AuditLogRecord, ConversationOverrideRecord, DeliveryStatusRecord, MessageRecord,
        SystemOverrideRecord,
    },
    db::{db_insert_audit_log, db_insert_message, db_upsert_delivery_status},
    errors::ApiFailure,
};

pub(crate) async fn conversation_meta(
    state: &AppState,
    conversation_id: &str,
) -> Option<(ConversationKind, bool)> {
    state
        .conversations
        .read()
        .await
        .get(conversation_id)
        .map(|record| (record.kind, record.active))
}

pub(crate) async fn membership_snapshot(
    state: &AppState,
    conversation_id: &str,
    user_id: &str,
) -> Option<MembershipSnapshot> {
    state
        .conversations
        .read()
        .await
        .get(conversation_id)
        .and_then(|record| record.members.get(user_id))
        .map(|membership| MembershipSnapshot {
            active: membership.active,
            role: membership.role,
        })
}

pub(crate) async fn get_user_override(
    state: &AppState,
    user_id: &str,
) -> Option<(SystemPermissionSet, u64)> {
    state
        .user_overrides
        .read()
        .await
        .get(user_id)
        .map(|record| (record.mask, record.version))
}

/// Overrides of the user's ACTIVE system roles, in no particular order.
/// Union is commutative so ordering does not matter to resolution.
pub(crate) async fn active_role_overrides(
    state: &AppState,
    user_id: &str,
) -> Vec<SystemPermissionSet> {
    let assigned = state
        .user_roles
        .read()
        .await
        .get(user_id)
        .cloned()
        .unwrap_or_default();
    let roles = state.system_roles.read().await;
    assigned
        .iter()
        .filter_map(|role_id| roles.get(role_id))
        .filter(|record| record.active)
        .map(|record| record.permissions)
        .collect()
}

pub(crate) async fn get_role_override(
    state: &AppState,
    role_id: &str,
) -> Option<(SystemPermissionSet, u64)> {
    state
        .system_roles
        .read()
        .await
        .get(role_id)
        .map(|record| (record.permissions, record.version))
}

pub(crate) async fn get_conversation_role_override(
    state: &AppState,
    conversation_id: &str,
    role: ConversationRole,
) -> Option<(ConversationPermissionSet, u64)> {
    state
        .conversations
        .read()
        .await
        .get(conversation_id)
        .and_then(|record| record.role_overrides.get(&role))
        .map(|record| (record.mask, record.version))
}

/// Versioned write of a per-user override. The expected version must match
/// the stored row exactly (`None` matches an absent row); a mismatch is a
/// lost race and surfaces as `Conflict`. Applied under the writer lock so
/// readers never observe a torn mask.
pub(crate) async fn upsert_user_override(
    state: &AppState,
    actor_id: UserId,
    user_id: &str,
    mask: SystemPermissionSet,
    expected_version: Option<u64>,
) -> Result<u64, ApiFailure> {
    let mut overrides = state.user_overrides.write().await;
    let current_version = overrides.get(user_id).map(|record| record.version);
    if current_version != expected_version {
        return Err(ApiFailure::Conflict);
    }
    let next_version = current_version.unwrap_or(0) + 1;
    overrides.insert(
        user_id.to_owned(),
        SystemOverrideRecord {
            mask,
            version: next_version,
            updated_by: actor_id,
            updated_at_unix: now_unix(),
        },
    );
    Ok(next_version)
}

pub(crate) async fn upsert_role_override(
    state: &AppState,
    role_id: &str,
    mask: SystemPermissionSet,
    expected_version: Option<u64>,
) -> Result<u64, ApiFailure> {
    let mut roles = state.system_roles.write().await;
    let Some(record) = roles.get_mut(role_id) else {
        return Err(ApiFailure::NotFound);
    };
    if expected_version != Some(record.version) {
        return Err(ApiFailure::Conflict);
    }
    record.permissions = mask;
    record.version += 1;
    Ok(record.version)
}

pub(crate) async fn upsert_conversation_role_override(
    state: &AppState,
    actor_id: UserId,
    conversation_id: &str,
    role: ConversationRole,
    mask: ConversationPermissionSet,
    expected_version: Option<u64>,
) -> Result<u64, ApiFailure> {
    let mut conversations = state.conversations.write().await;
    let Some(conversation) = conversations.get_mut(conversation_id) else {
        return Err(ApiFailure::NotFound);
    };
    let current_version = conversation
        .role_overrides
        .get(&role)
        .map(|record| record.version);
    if current_version != expected_version {
        return Err(ApiFailure::Conflict);
    }
    let next_version = current_version.unwrap_or(0) + 1;
    conversation.role_overrides.insert(
        role,
        ConversationOverrideRecord {
            mask,
            version: next_version,
            updated_by: actor_id,
            updated_at_unix: now_unix(),
        },
    );
    Ok(next_version)
}

pub(crate) async fn list_active_memberships(state: &AppState, user_id: &str) -> Vec<String> {
    state
        .conversations
        .read()
        .await
        .iter()
        .filter(|(_, record)| {
            record.active
                && record
                    .members
                    .get(user_id)
                    .is_some_and(|membership| membership.active)
        })
        .map(|(conversation_id, _)| conversation_id.clone())
        .collect()
}

pub(crate) async fn active_member_ids(state: &AppState, conversation_id: &str) -> Vec<UserId> {
    state
        .conversations
        .read()
        .await
        .get(conversation_id)
        .map(|record| {
            record
                .members
                .values()
                .filter(|membership| membership.active)
                .map(|membership| membership.user_id)
                .collect()
        })
        .unwrap_or_default()
}

/// Appends the message and moves the conversation's last-message pointer in
/// the same critical section, so readers never see the pointer ahead of the
/// message list.
pub(crate) async fn append_message(
    state: &AppState,
    conversation_id: &str,
    message: MessageRecord,
) -> Result<(), ApiFailure> {
    {
        let mut conversations = state.conversations.write().await;
        let Some(conversation) = conversations.get_mut(conversation_id) else {
            return Err(ApiFailure::NotFound);
        };
        conversation.last_message_id = Some(message.id.clone());
        conversation.messages.push(message.clone());
    }
    db_insert_message(state, conversation_id, &message).await
}

pub(crate) async fn message_sender(
    state: &AppState,
    conversation_id: &str,
    message_id: &str,
) -> Option<UserId> {
    state
        .conversations
        .read()
        .await
        .get(conversation_id)
        .and_then(|record| {
            record
                .messages
                .iter()
                .find(|message| message.id == message_id)
        })
        .map(|message| message.sender_id)
}

pub(crate) async fn upsert_delivery_status(
    state: &AppState,
    message_id: &str,
    user_id: &str,
    delivery_state: DeliveryState,
) -> Result<(), ApiFailure> {
    let updated_at_unix = now_unix();
    state.delivery_statuses.write().await.insert(
        (message_id.to_owned(), user_id.to_owned()),
        DeliveryStatusRecord {
            state: delivery_state,
            updated_at_unix,
        },
    );
    db_upsert_delivery_status(state, message_id, user_id, delivery_state, updated_at_unix).await
}

pub(crate) async fn set_last_read(
    state: &AppState,
    conversation_id: &str,
    user_id: &str,
    message_id: &str,
) -> Result<(), ApiFailure> {
    let mut conversations = state.conversations.write().await;
    let Some(conversation) = conversations.get_mut(conversation_id) else {
        return Err(ApiFailure::NotFound);
    };
    let Some(membership) = conversation.members.get_mut(user_id) else {
        return Err(ApiFailure::NotFound);
    };
    membership.last_read_message_id = Some(message_id.to_owned());
    membership.last_read_at_unix = Some(now_unix());
    Ok(())
}

/// Audit writes never fail the operation they record. The in-memory log is
/// authoritative; the Postgres copy is best effort.
pub(crate) async fn write_audit_log(
    state: &AppState,
    actor_id: UserId,
    action: &str,
    entity: &str,
    outcome: &str,
    detail: serde_json::Value,
) {
    let record = AuditLogRecord {
        actor_id: actor_id.to_string(),
        action: action.to_owned(),
        entity: entity.to_owned(),
        outcome: outcome.to_owned(),
        detail,
        created_at_unix: now_unix(),
    };
    state.audit_logs.write().await.push(record.clone());
    if let Err(error) = db_insert_audit_log(state, &record).await {
        tracing::warn!(event = "audit.db_write_failed", action = %action, error = %error);
    }
}

#[cfg(test)]
mod tests {
    use parley_core::{
        permissions::{basic_user, SystemPermissionSet},
        ConversationKind, ConversationRole, UserId,
    };

    use super::{
        append_message, list_active_memberships, upsert_conversation_role_override,
        upsert_user_override,
    };
    use crate::server::core::{
        AppConfig, AppState, ConversationRecord, MembershipRecord, MessageRecord,
    };
    use crate::server::errors::ApiFailure;

    fn state() -> AppState {
        AppState::new(&AppConfig::default()).expect("state should initialize")
    }

    async fn seed_conversation(state: &AppState, conversation_id: &str, member: UserId) {
        let mut members = std::collections::HashMap::new();
        members.insert(
            member.to_string(),
            MembershipRecord {
                user_id: member,
                role: ConversationRole::Owner,
                active: true,
                joined_at_unix: 0,
                added_by: member,
                left_at_unix: None,
                muted: false,
                muted_until_unix: None,
                last_read_message_id: None,
                last_read_at_unix: None,
            },
        );
        state.conversations.write().await.insert(
            conversation_id.to_owned(),
            ConversationRecord {
                kind: ConversationKind::Group,
                name: Some(String::from("room")),
                created_by: member,
                created_at_unix: 0,
                active: true,
                last_message_id: None,
                allow_members_to_add_others: true,
                max_members: 10,
                members,
                messages: Vec::new(),
                role_overrides: std::collections::HashMap::new(),
            },
        );
    }

    #[tokio::test]
    async fn user_override_versions_advance_and_conflict_on_stale_reads() {
        let state = state();
        let actor = UserId::new();

        let v1 = upsert_user_override(&state, actor, "u1", basic_user(), None)
            .await
            .expect("initial write");
        assert_eq!(v1, 1);

        let v2 = upsert_user_override(&state, actor, "u1", SystemPermissionSet::empty(), Some(1))
            .await
            .expect("versioned write");
        assert_eq!(v2, 2);

        let stale = upsert_user_override(&state, actor, "u1", basic_user(), Some(1)).await;
        assert_eq!(stale.unwrap_err(), ApiFailure::Conflict);

        let absent_expected =
            upsert_user_override(&state, actor, "u1", basic_user(), None).await;
        assert_eq!(absent_expected.unwrap_err(), ApiFailure::Conflict);
    }

    #[tokio::test]
    async fn conversation_override_write_requires_existing_conversation() {
        let state = state();
        let actor = UserId::new();
        let missing = upsert_conversation_role_override(
            &state,
            actor,
            "nope",
            ConversationRole::Member,
            parley_core::permissions::read_only(),
            None,
        )
        .await;
        assert_eq!(missing.unwrap_err(), ApiFailure::NotFound);
    }

    #[tokio::test]
    async fn append_message_moves_last_message_pointer() {
        let state = state();
        let member = UserId::new();
        seed_conversation(&state, "c1", member).await;

        append_message(
            &state,
            "c1",
            MessageRecord {
                id: String::from("m1"),
                sender_id: member,
                kind: parley_core::MessageKind::Text,
                content: String::from("hello"),
                reply_to_message_id: None,
                created_at_unix: 1,
            },
        )
        .await
        .expect("append");

        let conversations = state.conversations.read().await;
        let record = conversations.get("c1").expect("conversation");
        assert_eq!(record.last_message_id.as_deref(), Some("m1"));
        assert_eq!(record.messages.len(), 1);
    }

    #[tokio::test]
    async fn inactive_memberships_are_not_listed() {
        let state = state();
        let member = UserId::new();
        seed_conversation(&state, "c1", member).await;
        seed_conversation(&state, "c2", member).await;
        state
            .conversations
            .write()
            .await
            .get_mut("c2")
            .expect("conversation")
            .members
            .get_mut(&member.to_string())
            .expect("membership")
            .active = false;

        let listed = list_active_memberships(&state, &member.to_string()).await;
        assert_eq!(listed, vec![String::from("c1")]);
    }
}
