use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use parley_core::{
    permissions::{mask_conversation_bits, ConversationPermission},
    ConversationRole,
};

use crate::server::{
    auth::authenticate,
    core::AppState,
    errors::ApiFailure,
    permissions::{require_conversation_permission, update_conversation_role_permissions},
    registry,
    types::{
        AddMemberRequest, ConversationCreatedResponse, ConversationSummary, CreateDirectRequest,
        CreateGroupRequest, MemberResponse, UpdatePermissionMaskRequest, VersionResponse,
    },
};

pub(crate) async fn create_direct(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateDirectRequest>,
) -> Result<Json<ConversationCreatedResponse>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let conversation_id =
        registry::create_direct_conversation(&state, &auth, &payload.peer_user_id).await?;
    Ok(Json(ConversationCreatedResponse { conversation_id }))
}

pub(crate) async fn create_group(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateGroupRequest>,
) -> Result<Json<ConversationCreatedResponse>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let conversation_id =
        registry::create_group_conversation(&state, &auth, payload.name, &payload.member_ids)
            .await?;
    Ok(Json(ConversationCreatedResponse { conversation_id }))
}

/// Conversations the caller is an active member of.
pub(crate) async fn list_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ConversationSummary>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let user_id = auth.user_id.to_string();
    let conversations = state.conversations.read().await;
    let mut summaries: Vec<ConversationSummary> = conversations
        .iter()
        .filter(|(_, record)| {
            record.active
                && record
                    .members
                    .get(&user_id)
                    .is_some_and(|membership| membership.active)
        })
        .map(|(conversation_id, record)| ConversationSummary {
            conversation_id: conversation_id.clone(),
            kind: record.kind,
            name: record.name.clone(),
            last_message_id: record.last_message_id.clone(),
        })
        .collect();
    summaries.sort_by(|a, b| a.conversation_id.cmp(&b.conversation_id));
    Ok(Json(summaries))
}

pub(crate) async fn list_members(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> Result<Json<Vec<MemberResponse>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    require_conversation_permission(
        &state,
        &auth,
        &conversation_id,
        ConversationPermission::ViewMembers,
        "conversation.view_members",
    )
    .await?;

    let mut members: Vec<MemberResponse> = registry::list_active_members(&state, &conversation_id)
        .await?
        .into_iter()
        .map(|membership| MemberResponse {
            user_id: membership.user_id.to_string(),
            role: membership.role,
            joined_at_unix: membership.joined_at_unix,
            last_read_message_id: membership.last_read_message_id,
            last_read_at_unix: membership.last_read_at_unix,
        })
        .collect();
    members.sort_by(|a, b| a.user_id.cmp(&b.user_id));
    Ok(Json(members))
}

pub(crate) async fn add_member(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Json(payload): Json<AddMemberRequest>,
) -> Result<Json<Vec<MemberResponse>>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    registry::add_member(&state, &auth, &conversation_id, &payload.user_id).await?;
    let members = registry::list_active_members(&state, &conversation_id)
        .await?
        .into_iter()
        .map(|membership| MemberResponse {
            user_id: membership.user_id.to_string(),
            role: membership.role,
            joined_at_unix: membership.joined_at_unix,
            last_read_message_id: membership.last_read_message_id,
            last_read_at_unix: membership.last_read_at_unix,
        })
        .collect();
    Ok(Json(members))
}

pub(crate) async fn remove_member(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((conversation_id, user_id)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    registry::remove_member(&state, &auth, &conversation_id, &user_id).await?;
    Ok(Json(serde_json::json!({ "removed": true })))
}

/// Replaces the permission override of one rank within a conversation.
/// Unknown mask bits are rejected outright rather than masked away.
pub(crate) async fn update_rank_permissions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((conversation_id, rank)): Path<(String, String)>,
    Json(payload): Json<UpdatePermissionMaskRequest>,
) -> Result<Json<VersionResponse>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    let role = ConversationRole::try_from(rank).map_err(|_| ApiFailure::InvalidRequest)?;
    let (mask, rejected) = mask_conversation_bits(payload.mask);
    if rejected != 0 {
        return Err(ApiFailure::InvalidRequest);
    }

    let version = update_conversation_role_permissions(
        &state,
        &auth,
        &conversation_id,
        role,
        mask,
        payload.expected_version,
    )
    .await?;
    Ok(Json(VersionResponse { version }))
}
