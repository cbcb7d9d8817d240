use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use parley_core::permissions::{mask_system_bits, SystemPermission};

use crate::server::{
    auth::authenticate,
    core::AppState,
    errors::ApiFailure,
    permissions::{
        assign_role, create_role, grant_user_permission, remove_role, require_system_permission,
        resolve_system_permissions, revoke_user_permission, update_role_permissions,
    },
    store,
    types::{
        CreateRoleRequest, PermissionToggleRequest, RoleCreatedResponse,
        UpdatePermissionMaskRequest, UserPermissionsResponse, VersionResponse,
    },
};

/// Effective system permissions of a user. Callers may always read their
/// own; reading anyone else requires user management.
pub(crate) async fn get_user_permissions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<Json<UserPermissionsResponse>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    if auth.user_id.to_string() != user_id {
        require_system_permission(
            &state,
            &auth,
            SystemPermission::ManageUsers,
            "system.manage_users",
        )
        .await?;
    }
    if !state.user_ids.read().await.contains_key(&user_id) {
        return Err(ApiFailure::NotFound);
    }

    let effective = resolve_system_permissions(&state, &user_id).await;
    let override_version = store::get_user_override(&state, &user_id)
        .await
        .map(|(_, version)| version);
    Ok(Json(UserPermissionsResponse {
        user_id,
        mask: effective.bits(),
        override_version,
    }))
}

pub(crate) async fn grant_permission(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Json(payload): Json<PermissionToggleRequest>,
) -> Result<Json<VersionResponse>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let version = grant_user_permission(&state, &auth, &user_id, payload.permission).await?;
    Ok(Json(VersionResponse { version }))
}

pub(crate) async fn revoke_permission(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Json(payload): Json<PermissionToggleRequest>,
) -> Result<Json<VersionResponse>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let version = revoke_user_permission(&state, &auth, &user_id, payload.permission).await?;
    Ok(Json(VersionResponse { version }))
}

pub(crate) async fn create_system_role(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateRoleRequest>,
) -> Result<Json<RoleCreatedResponse>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let (mask, rejected) = mask_system_bits(payload.mask);
    if rejected != 0 {
        return Err(ApiFailure::InvalidRequest);
    }
    let role_id = create_role(&state, &auth, &payload.name, mask).await?;
    Ok(Json(RoleCreatedResponse {
        role_id,
        version: 1,
    }))
}

pub(crate) async fn update_system_role_permissions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(role_id): Path<String>,
    Json(payload): Json<UpdatePermissionMaskRequest>,
) -> Result<Json<VersionResponse>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let (mask, rejected) = mask_system_bits(payload.mask);
    if rejected != 0 {
        return Err(ApiFailure::InvalidRequest);
    }
    let version =
        update_role_permissions(&state, &auth, &role_id, mask, payload.expected_version).await?;
    Ok(Json(VersionResponse { version }))
}

pub(crate) async fn assign_role_to_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((user_id, role_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    assign_role(&state, &auth, &user_id, &role_id).await?;
    Ok(Json(serde_json::json!({ "assigned": true })))
}

pub(crate) async fn remove_role_from_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((user_id, role_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    remove_role(&state, &auth, &user_id, &role_id).await?;
    Ok(Json(serde_json::json!({ "removed": true })))
}
