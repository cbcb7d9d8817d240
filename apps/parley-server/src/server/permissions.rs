use parley_core::{
    permissions::{
        self, ConversationPermission, ConversationPermissionSet, SystemPermission,
        SystemPermissionSet,
    },
    ConversationKind, ConversationRole,
};
use tokio::time::timeout;
use ulid::Ulid;

use super::{
    core::{AppState, AuthContext, SystemRoleRecord},
    errors::ApiFailure,
    metrics::record_permission_denied,
    store,
};

/// Effective system permissions for a user, resolved from the stored
/// override and active role rows.
pub(crate) async fn resolve_system_permissions(
    state: &AppState,
    user_id: &str,
) -> SystemPermissionSet {
    let user_override = store::get_user_override(state, user_id)
        .await
        .map(|(mask, _)| mask);
    let role_overrides = store::active_role_overrides(state, user_id).await;
    permissions::resolve_system_permissions(user_override, &role_overrides)
}

pub(crate) async fn resolve_conversation_permissions(
    state: &AppState,
    user_id: &str,
    conversation_id: &str,
) -> Result<ConversationPermissionSet, ApiFailure> {
    let Some((kind, _)) = store::conversation_meta(state, conversation_id).await else {
        return Err(ApiFailure::NotFound);
    };
    let membership = store::membership_snapshot(state, conversation_id, user_id).await;
    let rank_override = match membership {
        Some(snapshot) if !matches!(kind, ConversationKind::Direct) => {
            store::get_conversation_role_override(state, conversation_id, snapshot.role)
                .await
                .map(|(mask, _)| mask)
        }
        _ => None,
    };
    Ok(permissions::resolve_conversation_permissions(
        kind,
        membership,
        rank_override,
    ))
}

/// Permission gate. A store lookup that exceeds the configured timeout is a
/// DENY, never an allow; the audit outcome distinguishes it from a policy
/// refusal.
pub(crate) async fn require_system_permission(
    state: &AppState,
    actor: &AuthContext,
    permission: SystemPermission,
    check: &'static str,
) -> Result<(), ApiFailure> {
    let actor_id = actor.user_id.to_string();
    let resolved = timeout(
        state.runtime.store_timeout,
        resolve_system_permissions(state, &actor_id),
    )
    .await;
    match resolved {
        Ok(set) if set.contains(permission) => Ok(()),
        Ok(_) => {
            record_permission_denied("http", check);
            store::write_audit_log(
                state,
                actor.user_id,
                "permissions.check",
                check,
                "forbidden",
                serde_json::json!({}),
            )
            .await;
            Err(ApiFailure::Forbidden)
        }
        Err(_) => {
            tracing::warn!(event = "permissions.store_timeout", check = %check);
            record_permission_denied("http", check);
            store::write_audit_log(
                state,
                actor.user_id,
                "permissions.check",
                check,
                "store_timeout",
                serde_json::json!({}),
            )
            .await;
            Err(ApiFailure::Forbidden)
        }
    }
}

pub(crate) async fn require_conversation_permission(
    state: &AppState,
    actor: &AuthContext,
    conversation_id: &str,
    permission: ConversationPermission,
    check: &'static str,
) -> Result<(), ApiFailure> {
    let actor_id = actor.user_id.to_string();
    let resolved = timeout(
        state.runtime.store_timeout,
        resolve_conversation_permissions(state, &actor_id, conversation_id),
    )
    .await;
    match resolved {
        Ok(Ok(set)) if set.contains(permission) => Ok(()),
        Ok(Ok(_)) => {
            record_permission_denied("conversation", check);
            Err(ApiFailure::Forbidden)
        }
        Ok(Err(failure)) => Err(failure),
        Err(_) => {
            tracing::warn!(
                event = "permissions.store_timeout",
                conversation_id = %conversation_id,
                check = %check
            );
            record_permission_denied("conversation", check);
            Err(ApiFailure::Forbidden)
        }
    }
}

fn audit_outcome(failure: &ApiFailure) -> &'static str {
    match failure {
        ApiFailure::Forbidden => "forbidden",
        ApiFailure::Conflict => "version_conflict",
        ApiFailure::NotFound => "not_found",
        ApiFailure::InvariantViolation => "invariant_violation",
        _ => "error",
    }
}

/// Single authorized funnel for per-user override writes. Every mutation
/// path, including grant and revoke, lands here; the attempt is audited
/// whether it succeeds or not.
pub(crate) async fn update_user_permissions(
    state: &AppState,
    actor: &AuthContext,
    target_user_id: &str,
    mask: SystemPermissionSet,
    expected_version: Option<u64>,
) -> Result<u64, ApiFailure> {
    let result =
        update_user_permissions_inner(state, actor, target_user_id, mask, expected_version).await;
    let outcome = match &result {
        Ok(_) => "ok",
        Err(failure) => audit_outcome(failure),
    };
    store::write_audit_log(
        state,
        actor.user_id,
        "permissions.user.update",
        target_user_id,
        outcome,
        serde_json::json!({ "mask": mask.bits() }),
    )
    .await;
    result
}

async fn update_user_permissions_inner(
    state: &AppState,
    actor: &AuthContext,
    target_user_id: &str,
    mask: SystemPermissionSet,
    expected_version: Option<u64>,
) -> Result<u64, ApiFailure> {
    require_system_permission(
        state,
        actor,
        SystemPermission::ManageUsers,
        "system.manage_users",
    )
    .await?;
    if !state.user_ids.read().await.contains_key(target_user_id) {
        return Err(ApiFailure::NotFound);
    }
    store::upsert_user_override(state, actor.user_id, target_user_id, mask, expected_version).await
}

/// Read-modify-write grant. The version read is carried into the write, so
/// a concurrent toggle surfaces as `Conflict` instead of silently losing a
/// bit.
pub(crate) async fn grant_user_permission(
    state: &AppState,
    actor: &AuthContext,
    target_user_id: &str,
    permission: SystemPermission,
) -> Result<u64, ApiFailure> {
    let current = store::get_user_override(state, target_user_id).await;
    let (mut mask, version) = match current {
        Some((mask, version)) => (mask, Some(version)),
        None => (permissions::basic_user(), None),
    };
    mask.insert(permission);
    update_user_permissions(state, actor, target_user_id, mask, version).await
}

pub(crate) async fn revoke_user_permission(
    state: &AppState,
    actor: &AuthContext,
    target_user_id: &str,
    permission: SystemPermission,
) -> Result<u64, ApiFailure> {
    let current = store::get_user_override(state, target_user_id).await;
    let (mut mask, version) = match current {
        Some((mask, version)) => (mask, Some(version)),
        None => (permissions::basic_user(), None),
    };
    mask.remove(permission);
    update_user_permissions(state, actor, target_user_id, mask, version).await
}

pub(crate) async fn create_role(
    state: &AppState,
    actor: &AuthContext,
    name: &str,
    mask: SystemPermissionSet,
) -> Result<String, ApiFailure> {
    require_system_permission(
        state,
        actor,
        SystemPermission::ManageRoles,
        "system.manage_roles",
    )
    .await?;
    let role_id = Ulid::new().to_string();
    state.system_roles.write().await.insert(
        role_id.clone(),
        SystemRoleRecord {
            name: name.to_owned(),
            permissions: mask,
            version: 1,
            active: true,
        },
    );
    store::write_audit_log(
        state,
        actor.user_id,
        "roles.create",
        &role_id,
        "ok",
        serde_json::json!({ "name": name, "mask": mask.bits() }),
    )
    .await;
    Ok(role_id)
}

pub(crate) async fn update_role_permissions(
    state: &AppState,
    actor: &AuthContext,
    role_id: &str,
    mask: SystemPermissionSet,
    expected_version: Option<u64>,
) -> Result<u64, ApiFailure> {
    let result = async {
        require_system_permission(
            state,
            actor,
            SystemPermission::ManageRoles,
            "system.manage_roles",
        )
        .await?;
        store::upsert_role_override(state, role_id, mask, expected_version).await
    }
    .await;
    let outcome = match &result {
        Ok(_) => "ok",
        Err(failure) => audit_outcome(failure),
    };
    store::write_audit_log(
        state,
        actor.user_id,
        "permissions.role.update",
        role_id,
        outcome,
        serde_json::json!({ "mask": mask.bits() }),
    )
    .await;
    result
}

/// Assigning a role the user already holds is a no-op success; removing a
/// role the user does not hold likewise.
pub(crate) async fn assign_role(
    state: &AppState,
    actor: &AuthContext,
    target_user_id: &str,
    role_id: &str,
) -> Result<(), ApiFailure> {
    require_system_permission(
        state,
        actor,
        SystemPermission::ManageUsers,
        "system.manage_users",
    )
    .await?;
    if !state.system_roles.read().await.contains_key(role_id) {
        return Err(ApiFailure::NotFound);
    }
    if !state.user_ids.read().await.contains_key(target_user_id) {
        return Err(ApiFailure::NotFound);
    }
    let inserted = state
        .user_roles
        .write()
        .await
        .entry(target_user_id.to_owned())
        .or_default()
        .insert(role_id.to_owned());
    store::write_audit_log(
        state,
        actor.user_id,
        "roles.assign",
        target_user_id,
        if inserted { "ok" } else { "noop" },
        serde_json::json!({ "role_id": role_id }),
    )
    .await;
    Ok(())
}

pub(crate) async fn remove_role(
    state: &AppState,
    actor: &AuthContext,
    target_user_id: &str,
    role_id: &str,
) -> Result<(), ApiFailure> {
    require_system_permission(
        state,
        actor,
        SystemPermission::ManageUsers,
        "system.manage_users",
    )
    .await?;
    let removed = state
        .user_roles
        .write()
        .await
        .get_mut(target_user_id)
        .is_some_and(|assigned| assigned.remove(role_id));
    store::write_audit_log(
        state,
        actor.user_id,
        "roles.remove",
        target_user_id,
        if removed { "ok" } else { "noop" },
        serde_json::json!({ "role_id": role_id }),
    )
    .await;
    Ok(())
}

/// Per-rank conversation override writes. Direct conversations never carry
/// overrides; the attempt is refused before any store write.
pub(crate) async fn update_conversation_role_permissions(
    state: &AppState,
    actor: &AuthContext,
    conversation_id: &str,
    role: ConversationRole,
    mask: ConversationPermissionSet,
    expected_version: Option<u64>,
) -> Result<u64, ApiFailure> {
    let result = async {
        let Some((kind, _)) = store::conversation_meta(state, conversation_id).await else {
            return Err(ApiFailure::NotFound);
        };
        if matches!(kind, ConversationKind::Direct) {
            return Err(ApiFailure::InvariantViolation);
        }
        require_conversation_permission(
            state,
            actor,
            conversation_id,
            ConversationPermission::ManagePermissions,
            "conversation.manage_permissions",
        )
        .await?;
        store::upsert_conversation_role_override(
            state,
            actor.user_id,
            conversation_id,
            role,
            mask,
            expected_version,
        )
        .await
    }
    .await;
    let outcome = match &result {
        Ok(_) => "ok",
        Err(failure) => audit_outcome(failure),
    };
    store::write_audit_log(
        state,
        actor.user_id,
        "permissions.conversation.update",
        conversation_id,
        outcome,
        serde_json::json!({ "role": role.as_str(), "mask": mask.bits() }),
    )
    .await;
    result
}
