use std::net::SocketAddr;

use axum::{
    extract::{connect_info::ConnectInfo, Extension, State},
    http::HeaderMap,
    Json,
};
use parley_core::{UserId, Username};

use crate::server::{
    auth::{
        authenticate, enforce_auth_route_rate_limit, hash_password, issue_access_token, now_unix,
        resolve_client_ip, validate_password, verify_password,
    },
    core::{AppState, UserRecord, ACCESS_TOKEN_TTL_SECS, LOGIN_LOCK_SECS, LOGIN_LOCK_THRESHOLD},
    db::{db_insert_user, ensure_db_schema},
    errors::ApiFailure,
    metrics::record_auth_failure,
    types::{AuthResponse, LoginRequest, MeResponse, RegisterRequest, RegisterResponse},
};

fn client_ip_of(
    headers: &HeaderMap,
    connect_info: Option<&Extension<ConnectInfo<SocketAddr>>>,
) -> String {
    resolve_client_ip(headers, connect_info.map(|value| value.0 .0.ip()))
}

/// Registration answers `accepted` for taken usernames too, so the
/// endpoint cannot be used to probe which accounts exist.
pub(crate) async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    connect_info: Option<Extension<ConnectInfo<SocketAddr>>>,
    Json(payload): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiFailure> {
    let client_ip = client_ip_of(&headers, connect_info.as_ref());
    enforce_auth_route_rate_limit(&state, &client_ip, "register").await?;
    ensure_db_schema(&state).await?;

    let username = Username::try_from(payload.username).map_err(|_| ApiFailure::InvalidRequest)?;
    validate_password(&payload.password)?;
    let password_hash = hash_password(&payload.password).map_err(|_| ApiFailure::Internal)?;

    let user_id = UserId::new();
    let created = {
        let mut users = state.users.write().await;
        if users.contains_key(username.as_str()) {
            false
        } else {
            users.insert(
                username.as_str().to_owned(),
                UserRecord {
                    id: user_id,
                    username: username.clone(),
                    password_hash: password_hash.clone(),
                    failed_logins: 0,
                    locked_until_unix: None,
                },
            );
            true
        }
    };
    if created {
        state
            .user_ids
            .write()
            .await
            .insert(user_id.to_string(), username.as_str().to_owned());
        db_insert_user(&state, &user_id.to_string(), username.as_str(), &password_hash).await?;
        tracing::info!(event = "auth.register", outcome = "created");
    } else {
        tracing::info!(event = "auth.register", outcome = "existing_user");
    }

    Ok(Json(RegisterResponse { accepted: true }))
}

pub(crate) async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    connect_info: Option<Extension<ConnectInfo<SocketAddr>>>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, ApiFailure> {
    let client_ip = client_ip_of(&headers, connect_info.as_ref());
    enforce_auth_route_rate_limit(&state, &client_ip, "login").await?;

    let username = Username::try_from(payload.username).map_err(|_| ApiFailure::Unauthorized)?;
    validate_password(&payload.password).map_err(|_| ApiFailure::Unauthorized)?;
    let now = now_unix();

    let mut users = state.users.write().await;
    let Some(record) = users.get_mut(username.as_str()) else {
        // Burn a hash verification anyway so user existence is not
        // observable through response timing.
        let _ = verify_password(&state.dummy_password_hash, &payload.password);
        record_auth_failure("unknown_user");
        return Err(ApiFailure::Unauthorized);
    };

    if record.locked_until_unix.is_some_and(|until| until > now) {
        record_auth_failure("locked_out");
        tracing::warn!(event = "auth.login", outcome = "locked_out");
        return Err(ApiFailure::Unauthorized);
    }

    if !verify_password(&record.password_hash, &payload.password) {
        record.failed_logins = record.failed_logins.saturating_add(1);
        if record.failed_logins >= LOGIN_LOCK_THRESHOLD {
            record.locked_until_unix = Some(now + LOGIN_LOCK_SECS);
            record.failed_logins = 0;
            tracing::warn!(event = "auth.login", outcome = "lock_started");
        }
        record_auth_failure("bad_password");
        return Err(ApiFailure::Unauthorized);
    }

    record.failed_logins = 0;
    record.locked_until_unix = None;
    let user_id = record.id;
    drop(users);

    let access_token = issue_access_token(&state, user_id, username.as_str())
        .map_err(|_| ApiFailure::Internal)?;
    tracing::info!(event = "auth.login", outcome = "ok");
    Ok(Json(AuthResponse {
        access_token,
        expires_in_secs: ACCESS_TOKEN_TTL_SECS,
    }))
}

pub(crate) async fn me(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<MeResponse>, ApiFailure> {
    let auth = authenticate(&state, &headers).await?;
    Ok(Json(MeResponse {
        user_id: auth.user_id.to_string(),
        username: auth.username,
    }))
}
