use std::collections::HashMap;

use parley_core::{
    can_remove_member,
    permissions::{ConversationPermission, SystemPermission},
    ConversationKind, ConversationName, ConversationRole, UserId,
};
use ulid::Ulid;

use super::{
    auth::now_unix,
    core::{AppState, AuthContext, ConversationRecord, MembershipRecord},
    errors::ApiFailure,
    permissions::{
        require_conversation_permission, require_system_permission, resolve_conversation_permissions,
        resolve_system_permissions,
    },
    store,
};

fn new_membership(user_id: UserId, role: ConversationRole, added_by: UserId) -> MembershipRecord {
    MembershipRecord {
        user_id,
        role,
        active: true,
        joined_at_unix: now_unix(),
        added_by,
        left_at_unix: None,
        muted: false,
        muted_until_unix: None,
        last_read_message_id: None,
        last_read_at_unix: None,
    }
}

async fn user_exists(state: &AppState, user_id: &str) -> bool {
    state.user_ids.read().await.contains_key(user_id)
}

/// Direct conversations are deduplicated per pair: when an active one
/// already holds both peers, its id is returned instead of a new record.
pub(crate) async fn create_direct_conversation(
    state: &AppState,
    actor: &AuthContext,
    peer_user_id: &str,
) -> Result<String, ApiFailure> {
    require_system_permission(
        state,
        actor,
        SystemPermission::CreateDirectChat,
        "system.create_direct_chat",
    )
    .await?;
    let actor_id = actor.user_id.to_string();
    if peer_user_id == actor_id {
        return Err(ApiFailure::InvalidRequest);
    }
    if !user_exists(state, peer_user_id).await {
        return Err(ApiFailure::NotFound);
    }

    let mut conversations = state.conversations.write().await;
    let existing = conversations.iter().find(|(_, record)| {
        record.active
            && matches!(record.kind, ConversationKind::Direct)
            && record
                .members
                .get(&actor_id)
                .is_some_and(|membership| membership.active)
            && record
                .members
                .get(peer_user_id)
                .is_some_and(|membership| membership.active)
    });
    if let Some((conversation_id, _)) = existing {
        return Ok(conversation_id.clone());
    }

    let peer_id =
        UserId::try_from(peer_user_id.to_owned()).map_err(|_| ApiFailure::InvalidRequest)?;
    let conversation_id = Ulid::new().to_string();
    let mut members = HashMap::new();
    members.insert(
        actor_id,
        new_membership(actor.user_id, ConversationRole::Member, actor.user_id),
    );
    members.insert(
        peer_user_id.to_owned(),
        new_membership(peer_id, ConversationRole::Member, actor.user_id),
    );
    conversations.insert(
        conversation_id.clone(),
        ConversationRecord {
            kind: ConversationKind::Direct,
            name: None,
            created_by: actor.user_id,
            created_at_unix: now_unix(),
            active: true,
            last_message_id: None,
            allow_members_to_add_others: false,
            max_members: 2,
            members,
            messages: Vec::new(),
            role_overrides: HashMap::new(),
        },
    );
    drop(conversations);
    store::write_audit_log(
        state,
        actor.user_id,
        "conversations.create_direct",
        &conversation_id,
        "ok",
        serde_json::json!({ "peer": peer_user_id }),
    )
    .await;
    Ok(conversation_id)
}

pub(crate) async fn create_group_conversation(
    state: &AppState,
    actor: &AuthContext,
    name: String,
    member_ids: &[String],
) -> Result<String, ApiFailure> {
    require_system_permission(
        state,
        actor,
        SystemPermission::CreateGroup,
        "system.create_group",
    )
    .await?;
    let name = ConversationName::try_from(name).map_err(|_| ApiFailure::InvalidRequest)?;
    let max_members = state.runtime.max_conversation_members;
    if member_ids.len() + 1 > max_members {
        return Err(ApiFailure::InvariantViolation);
    }

    let actor_id = actor.user_id.to_string();
    let mut members = HashMap::new();
    members.insert(
        actor_id.clone(),
        new_membership(actor.user_id, ConversationRole::Owner, actor.user_id),
    );
    for member_id in member_ids {
        if *member_id == actor_id {
            continue;
        }
        if !user_exists(state, member_id).await {
            return Err(ApiFailure::NotFound);
        }
        let user_id =
            UserId::try_from(member_id.clone()).map_err(|_| ApiFailure::InvalidRequest)?;
        members.insert(
            member_id.clone(),
            new_membership(user_id, ConversationRole::Member, actor.user_id),
        );
    }

    let conversation_id = Ulid::new().to_string();
    state.conversations.write().await.insert(
        conversation_id.clone(),
        ConversationRecord {
            kind: ConversationKind::Group,
            name: Some(name.as_str().to_owned()),
            created_by: actor.user_id,
            created_at_unix: now_unix(),
            active: true,
            last_message_id: None,
            allow_members_to_add_others: true,
            max_members,
            members,
            messages: Vec::new(),
            role_overrides: HashMap::new(),
        },
    );
    store::write_audit_log(
        state,
        actor.user_id,
        "conversations.create_group",
        &conversation_id,
        "ok",
        serde_json::json!({ "member_count": member_ids.len() + 1 }),
    )
    .await;
    Ok(conversation_id)
}

/// Adds or reactivates a membership. Re-adding an active member is a no-op
/// success; a soft-removed row is reactivated in place so its history
/// survives.
pub(crate) async fn add_member(
    state: &AppState,
    actor: &AuthContext,
    conversation_id: &str,
    target_user_id: &str,
) -> Result<(), ApiFailure> {
    let result = add_member_inner(state, actor, conversation_id, target_user_id).await;
    let outcome = match &result {
        Ok(()) => "ok",
        Err(ApiFailure::Forbidden) => "forbidden",
        Err(ApiFailure::NotFound) => "not_found",
        Err(ApiFailure::InvariantViolation) => "invariant_violation",
        Err(_) => "error",
    };
    store::write_audit_log(
        state,
        actor.user_id,
        "membership.add",
        conversation_id,
        outcome,
        serde_json::json!({ "target": target_user_id }),
    )
    .await;
    result
}

async fn add_member_inner(
    state: &AppState,
    actor: &AuthContext,
    conversation_id: &str,
    target_user_id: &str,
) -> Result<(), ApiFailure> {
    let Some((kind, active)) = store::conversation_meta(state, conversation_id).await else {
        return Err(ApiFailure::NotFound);
    };
    if !active {
        return Err(ApiFailure::NotFound);
    }
    if matches!(kind, ConversationKind::Direct) {
        return Err(ApiFailure::InvariantViolation);
    }
    if !user_exists(state, target_user_id).await {
        return Err(ApiFailure::NotFound);
    }

    // The target must be allowed to join groups at the system level.
    let target_system = resolve_system_permissions(state, target_user_id).await;
    if !target_system.contains(SystemPermission::JoinGroup) {
        return Err(ApiFailure::Forbidden);
    }

    let actor_id = actor.user_id.to_string();
    let actor_permissions =
        resolve_conversation_permissions(state, &actor_id, conversation_id).await?;
    if !actor_permissions.contains(ConversationPermission::AddMembers) {
        let allowed_by_settings = {
            let conversations = state.conversations.read().await;
            let conversation = conversations.get(conversation_id);
            conversation.is_some_and(|record| {
                record.allow_members_to_add_others
                    && record
                        .members
                        .get(&actor_id)
                        .is_some_and(|membership| membership.active)
            })
        };
        if !allowed_by_settings {
            return Err(ApiFailure::Forbidden);
        }
    }

    let target_id =
        UserId::try_from(target_user_id.to_owned()).map_err(|_| ApiFailure::InvalidRequest)?;
    let mut conversations = state.conversations.write().await;
    let Some(conversation) = conversations.get_mut(conversation_id) else {
        return Err(ApiFailure::NotFound);
    };
    if let Some(membership) = conversation.members.get_mut(target_user_id) {
        if membership.active {
            return Ok(());
        }
        let active_count = conversation
            .members
            .values()
            .filter(|member| member.active)
            .count();
        if active_count >= conversation.max_members {
            return Err(ApiFailure::InvariantViolation);
        }
        let membership = conversation
            .members
            .get_mut(target_user_id)
            .ok_or(ApiFailure::NotFound)?;
        membership.active = true;
        membership.left_at_unix = None;
        membership.added_by = actor.user_id;
        return Ok(());
    }
    let active_count = conversation
        .members
        .values()
        .filter(|member| member.active)
        .count();
    if active_count >= conversation.max_members {
        return Err(ApiFailure::InvariantViolation);
    }
    conversation.members.insert(
        target_user_id.to_owned(),
        new_membership(target_id, ConversationRole::Member, actor.user_id),
    );
    Ok(())
}

/// Soft-removes a membership: the row stays, `active` flips, `left_at` is
/// stamped. Owner memberships are protected from removal by others unless
/// the actor carries system-level user management.
pub(crate) async fn remove_member(
    state: &AppState,
    actor: &AuthContext,
    conversation_id: &str,
    target_user_id: &str,
) -> Result<(), ApiFailure> {
    let result = remove_member_inner(state, actor, conversation_id, target_user_id).await;
    let outcome = match &result {
        Ok(()) => "ok",
        Err(ApiFailure::Forbidden) => "forbidden",
        Err(ApiFailure::NotFound) => "not_found",
        Err(ApiFailure::InvariantViolation) => "invariant_violation",
        Err(_) => "error",
    };
    store::write_audit_log(
        state,
        actor.user_id,
        "membership.remove",
        conversation_id,
        outcome,
        serde_json::json!({ "target": target_user_id }),
    )
    .await;
    result
}

async fn remove_member_inner(
    state: &AppState,
    actor: &AuthContext,
    conversation_id: &str,
    target_user_id: &str,
) -> Result<(), ApiFailure> {
    let actor_id = actor.user_id.to_string();
    let is_self_removal = actor_id == target_user_id;

    let (target_role, actor_role) = {
        let conversations = state.conversations.read().await;
        let Some(conversation) = conversations.get(conversation_id) else {
            return Err(ApiFailure::NotFound);
        };
        let Some(target) = conversation
            .members
            .get(target_user_id)
            .filter(|membership| membership.active)
        else {
            return Err(ApiFailure::NotFound);
        };
        let actor_role = conversation
            .members
            .get(&actor_id)
            .filter(|membership| membership.active)
            .map(|membership| membership.role);
        (target.role, actor_role)
    };

    if !is_self_removal {
        require_conversation_permission(
            state,
            actor,
            conversation_id,
            ConversationPermission::RemoveMembers,
            "conversation.remove_members",
        )
        .await?;
        let actor_role = actor_role.ok_or(ApiFailure::Forbidden)?;
        let actor_has_system_override = resolve_system_permissions(state, &actor_id)
            .await
            .contains(SystemPermission::ManageUsers);
        if !can_remove_member(actor_role, target_role, false, actor_has_system_override) {
            if matches!(target_role, ConversationRole::Owner) {
                return Err(ApiFailure::InvariantViolation);
            }
            return Err(ApiFailure::Forbidden);
        }
    }

    let mut conversations = state.conversations.write().await;
    let Some(conversation) = conversations.get_mut(conversation_id) else {
        return Err(ApiFailure::NotFound);
    };
    let Some(membership) = conversation.members.get_mut(target_user_id) else {
        return Err(ApiFailure::NotFound);
    };
    membership.active = false;
    membership.left_at_unix = Some(now_unix());
    Ok(())
}

pub(crate) async fn list_active_members(
    state: &AppState,
    conversation_id: &str,
) -> Result<Vec<MembershipRecord>, ApiFailure> {
    let conversations = state.conversations.read().await;
    let Some(conversation) = conversations.get(conversation_id) else {
        return Err(ApiFailure::NotFound);
    };
    Ok(conversation
        .members
        .values()
        .filter(|membership| membership.active)
        .cloned()
        .collect())
}

#[cfg(test)]
mod tests {
    use parley_core::{permissions, ConversationRole, UserId, Username};

    use super::{add_member, create_direct_conversation, create_group_conversation, remove_member};
    use crate::server::core::{AppConfig, AppState, AuthContext, SystemOverrideRecord, UserRecord};
    use crate::server::errors::ApiFailure;

    async fn register_user(state: &AppState, username: &str) -> AuthContext {
        let user_id = UserId::new();
        state.users.write().await.insert(
            username.to_owned(),
            UserRecord {
                id: user_id,
                username: Username::try_from(username.to_owned()).expect("valid username"),
                password_hash: String::from("x"),
                failed_logins: 0,
                locked_until_unix: None,
            },
        );
        state
            .user_ids
            .write()
            .await
            .insert(user_id.to_string(), username.to_owned());
        AuthContext {
            user_id,
            username: username.to_owned(),
        }
    }

    async fn register_group_creator(state: &AppState, username: &str) -> AuthContext {
        let actor = register_user(state, username).await;
        state.user_overrides.write().await.insert(
            actor.user_id.to_string(),
            SystemOverrideRecord {
                mask: permissions::group_moderator(),
                version: 1,
                updated_by: actor.user_id,
                updated_at_unix: 0,
            },
        );
        actor
    }

    fn state() -> AppState {
        AppState::new(&AppConfig::default()).expect("state should initialize")
    }

    #[tokio::test]
    async fn direct_conversations_are_deduplicated_per_pair() {
        let state = state();
        let alice = register_user(&state, "alice").await;
        let bob = register_user(&state, "bob").await;

        let first = create_direct_conversation(&state, &alice, &bob.user_id.to_string())
            .await
            .expect("create");
        let second = create_direct_conversation(&state, &alice, &bob.user_id.to_string())
            .await
            .expect("reuse");
        assert_eq!(first, second);

        let conversations = state.conversations.read().await;
        assert_eq!(conversations.len(), 1);
        let record = conversations.get(&first).expect("conversation");
        assert_eq!(record.members.len(), 2);
        assert!(record
            .members
            .values()
            .all(|membership| matches!(membership.role, ConversationRole::Member)));
    }

    #[tokio::test]
    async fn direct_conversation_with_self_is_rejected() {
        let state = state();
        let alice = register_user(&state, "alice").await;
        let rejected =
            create_direct_conversation(&state, &alice, &alice.user_id.to_string()).await;
        assert_eq!(rejected.unwrap_err(), ApiFailure::InvalidRequest);
    }

    #[tokio::test]
    async fn group_creator_becomes_owner() {
        let state = state();
        let alice = register_group_creator(&state, "alice").await;
        let bob = register_user(&state, "bob").await;

        let conversation_id = create_group_conversation(
            &state,
            &alice,
            String::from("platform"),
            &[bob.user_id.to_string()],
        )
        .await
        .expect("create group");

        let conversations = state.conversations.read().await;
        let record = conversations.get(&conversation_id).expect("conversation");
        assert_eq!(
            record.members[&alice.user_id.to_string()].role,
            ConversationRole::Owner
        );
        assert_eq!(
            record.members[&bob.user_id.to_string()].role,
            ConversationRole::Member
        );
        let fresh = &record.members[&bob.user_id.to_string()];
        assert!(!fresh.muted);
        assert!(fresh.muted_until_unix.is_none());
    }

    #[tokio::test]
    async fn re_adding_an_active_member_is_a_noop() {
        let state = state();
        let alice = register_group_creator(&state, "alice").await;
        let bob = register_user(&state, "bob").await;
        let conversation_id = create_group_conversation(
            &state,
            &alice,
            String::from("platform"),
            &[bob.user_id.to_string()],
        )
        .await
        .expect("create group");

        add_member(&state, &alice, &conversation_id, &bob.user_id.to_string())
            .await
            .expect("noop re-add");
        let conversations = state.conversations.read().await;
        assert_eq!(
            conversations
                .get(&conversation_id)
                .expect("conversation")
                .members
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn removal_is_soft_and_rejoin_reactivates_the_row() {
        let state = state();
        let alice = register_group_creator(&state, "alice").await;
        let bob = register_user(&state, "bob").await;
        let conversation_id = create_group_conversation(
            &state,
            &alice,
            String::from("platform"),
            &[bob.user_id.to_string()],
        )
        .await
        .expect("create group");

        remove_member(&state, &alice, &conversation_id, &bob.user_id.to_string())
            .await
            .expect("remove");
        {
            let conversations = state.conversations.read().await;
            let membership = &conversations
                .get(&conversation_id)
                .expect("conversation")
                .members[&bob.user_id.to_string()];
            assert!(!membership.active);
            assert!(membership.left_at_unix.is_some());
        }

        add_member(&state, &alice, &conversation_id, &bob.user_id.to_string())
            .await
            .expect("reactivate");
        let conversations = state.conversations.read().await;
        let membership = &conversations
            .get(&conversation_id)
            .expect("conversation")
            .members[&bob.user_id.to_string()];
        assert!(membership.active);
        assert!(membership.left_at_unix.is_none());
    }

    #[tokio::test]
    async fn owner_cannot_be_removed_without_system_override() {
        let state = state();
        let alice = register_group_creator(&state, "alice").await;
        let bob = register_user(&state, "bob").await;
        let conversation_id = create_group_conversation(
            &state,
            &alice,
            String::from("platform"),
            &[bob.user_id.to_string()],
        )
        .await
        .expect("create group");

        // promote bob so the conversation-level gate passes
        state
            .conversations
            .write()
            .await
            .get_mut(&conversation_id)
            .expect("conversation")
            .members
            .get_mut(&bob.user_id.to_string())
            .expect("membership")
            .role = ConversationRole::Admin;

        let refused =
            remove_member(&state, &bob, &conversation_id, &alice.user_id.to_string()).await;
        assert_eq!(refused.unwrap_err(), ApiFailure::InvariantViolation);
    }

    #[tokio::test]
    async fn owner_self_leave_is_allowed() {
        let state = state();
        let alice = register_group_creator(&state, "alice").await;
        let bob = register_user(&state, "bob").await;
        let conversation_id = create_group_conversation(
            &state,
            &alice,
            String::from("platform"),
            &[bob.user_id.to_string()],
        )
        .await
        .expect("create group");

        remove_member(&state, &alice, &conversation_id, &alice.user_id.to_string())
            .await
            .expect("self-leave");
    }

    #[tokio::test]
    async fn capacity_limit_blocks_new_members() {
        let config = AppConfig {
            max_conversation_members: 2,
            ..AppConfig::default()
        };
        let state = AppState::new(&config).expect("state should initialize");
        let alice = register_group_creator(&state, "alice").await;
        let bob = register_user(&state, "bob").await;
        let carol = register_user(&state, "carol").await;
        let conversation_id = create_group_conversation(
            &state,
            &alice,
            String::from("platform"),
            &[bob.user_id.to_string()],
        )
        .await
        .expect("create group");

        let refused =
            add_member(&state, &alice, &conversation_id, &carol.user_id.to_string()).await;
        assert_eq!(refused.unwrap_err(), ApiFailure::InvariantViolation);
    }
}
