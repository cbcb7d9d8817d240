use axum::{
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
    Json,
};
use parley_core::{ConversationKind, ConversationRole, MessageKind};
use serde::{Deserialize, Serialize};

use super::{core::METRICS_TEXT_CONTENT_TYPE, metrics::render_metrics};

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
    pub(crate) status: &'static str,
}

pub(crate) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub(crate) async fn metrics() -> Response {
    (
        [(CONTENT_TYPE, METRICS_TEXT_CONTENT_TYPE)],
        render_metrics(),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
pub(crate) struct ApiError {
    pub(crate) error: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct RegisterRequest {
    pub(crate) username: String,
    pub(crate) password: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct LoginRequest {
    pub(crate) username: String,
    pub(crate) password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct AuthResponse {
    pub(crate) access_token: String,
    pub(crate) expires_in_secs: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RegisterResponse {
    pub(crate) accepted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct MeResponse {
    pub(crate) user_id: String,
    pub(crate) username: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct CreateDirectRequest {
    pub(crate) peer_user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct CreateGroupRequest {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) member_ids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ConversationCreatedResponse {
    pub(crate) conversation_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ConversationSummary {
    pub(crate) conversation_id: String,
    pub(crate) kind: ConversationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) last_message_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct MemberResponse {
    pub(crate) user_id: String,
    pub(crate) role: ConversationRole,
    pub(crate) joined_at_unix: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) last_read_message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) last_read_at_unix: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct AddMemberRequest {
    pub(crate) user_id: String,
}

/// Masks travel as raw u64 bit sets; unknown bits are rejected at the
/// boundary rather than silently dropped.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct UpdatePermissionMaskRequest {
    pub(crate) mask: u64,
    pub(crate) expected_version: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct PermissionToggleRequest {
    pub(crate) permission: parley_core::permissions::SystemPermission,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct UserPermissionsResponse {
    pub(crate) user_id: String,
    pub(crate) mask: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) override_version: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct CreateRoleRequest {
    pub(crate) name: String,
    pub(crate) mask: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RoleCreatedResponse {
    pub(crate) role_id: String,
    pub(crate) version: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct VersionResponse {
    pub(crate) version: u64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GatewayAuthQuery {
    pub(crate) access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct GatewaySendMessage {
    pub(crate) conversation_id: String,
    pub(crate) content: String,
    pub(crate) kind: Option<MessageKind>,
    pub(crate) reply_to_message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct GatewayChatScope {
    pub(crate) conversation_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct GatewayMarkRead {
    pub(crate) conversation_id: String,
    pub(crate) message_id: String,
}
