use std::{
    net::IpAddr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::anyhow;
use argon2::{
    password_hash::rand_core::{OsRng, RngCore},
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::http::{header::AUTHORIZATION, HeaderMap};
use parley_core::UserId;
use parley_protocol::{Envelope, EventType, PROTOCOL_VERSION};
use pasetors::{
    claims::{Claims, ClaimsValidationRules},
    local,
    token::UntrustedToken,
    version4::V4,
    Local,
};
use serde::Serialize;
use sqlx::Row;

use super::{
    core::{AppState, AuthContext, ACCESS_TOKEN_TTL_SECS},
    errors::ApiFailure,
};

const MAX_X_FORWARDED_FOR_HEADER_CHARS: usize = 512;
const MAX_X_FORWARDED_FOR_ENTRY_CHARS: usize = 64;
const RATE_LIMIT_WINDOW_SECS: i64 = 60;

pub(crate) fn validate_password(value: &str) -> Result<(), ApiFailure> {
    let len = value.len();
    if (12..=128).contains(&len) {
        Ok(())
    } else {
        Err(ApiFailure::InvalidRequest)
    }
}

pub(crate) fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow!("password hash failed: {e}"))?
        .to_string();
    Ok(hash)
}

pub(crate) fn verify_password(stored_hash: &str, supplied_password: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(supplied_password.as_bytes(), &parsed)
        .is_ok()
}

pub(crate) fn issue_access_token(
    state: &AppState,
    user_id: UserId,
    username: &str,
) -> anyhow::Result<String> {
    let ttl = u64::try_from(ACCESS_TOKEN_TTL_SECS).unwrap_or(0);
    let mut claims = Claims::new_expires_in(&Duration::from_secs(ttl))
        .map_err(|e| anyhow!("claims init failed: {e}"))?;
    claims
        .subject(&user_id.to_string())
        .map_err(|e| anyhow!("claim sub failed: {e}"))?;
    claims
        .add_additional("username", username)
        .map_err(|e| anyhow!("claim username failed: {e}"))?;

    local::encrypt(&state.token_key, &claims, None, None)
        .map_err(|e| anyhow!("access token mint failed: {e}"))
}

pub(crate) fn verify_access_token(state: &AppState, token: &str) -> anyhow::Result<Claims> {
    let untrusted = UntrustedToken::<Local, V4>::try_from(token).map_err(|e| anyhow!("{e}"))?;
    let validation_rules = ClaimsValidationRules::new();
    let trusted = local::decrypt(&state.token_key, &untrusted, &validation_rules, None, None)
        .map_err(|e| anyhow!("token decrypt failed: {e}"))?;
    trusted
        .payload_claims()
        .cloned()
        .ok_or_else(|| anyhow!("token claims missing"))
}

pub(crate) async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<AuthContext, ApiFailure> {
    let access_token = bearer_token(headers).ok_or(ApiFailure::Unauthorized)?;
    authenticate_with_token(state, access_token).await
}

pub(crate) async fn authenticate_with_token(
    state: &AppState,
    access_token: &str,
) -> Result<AuthContext, ApiFailure> {
    let claims = verify_access_token(state, access_token).map_err(|_| ApiFailure::Unauthorized)?;
    let user_id = claims
        .get_claim("sub")
        .and_then(serde_json::Value::as_str)
        .ok_or(ApiFailure::Unauthorized)?;
    let username = find_username_by_subject(state, user_id)
        .await
        .ok_or(ApiFailure::Unauthorized)?;
    let user_id = UserId::try_from(user_id.to_owned()).map_err(|_| ApiFailure::Unauthorized)?;
    Ok(AuthContext { user_id, username })
}

pub(crate) async fn find_username_by_subject(state: &AppState, user_id: &str) -> Option<String> {
    if let Some(pool) = &state.db_pool {
        let row = sqlx::query("SELECT username FROM users WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(pool)
            .await
            .ok()?;
        if let Some(value) = row {
            return value.try_get("username").ok();
        }
    }
    state.user_ids.read().await.get(user_id).cloned()
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let header = headers.get(AUTHORIZATION)?;
    let header = header.to_str().ok()?;
    header.strip_prefix("Bearer ")
}

pub(crate) fn now_unix() -> i64 {
    let now = SystemTime::now();
    let seconds = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs();
    i64::try_from(seconds).unwrap_or(i64::MAX)
}

pub(crate) async fn enforce_auth_route_rate_limit(
    state: &AppState,
    client_ip: &str,
    route: &str,
) -> Result<(), ApiFailure> {
    let key = format!("{route}:{client_ip}");
    let now = now_unix();

    let mut hits = state.auth_route_hits.write().await;
    hits.retain(|_, route_hits| {
        route_hits.retain(|timestamp| now.saturating_sub(*timestamp) < RATE_LIMIT_WINDOW_SECS);
        !route_hits.is_empty()
    });
    let route_hits = hits.entry(key).or_default();
    let max_hits =
        usize::try_from(state.runtime.auth_route_requests_per_minute).unwrap_or(usize::MAX);
    if route_hits.len() >= max_hits {
        tracing::warn!(event = "auth.rate_limit", route = %route, client_ip = %client_ip);
        return Err(ApiFailure::RateLimited);
    }
    route_hits.push(now);
    Ok(())
}

/// Rate-limit key for auth routes: first forwarded entry when present and
/// parseable, else the socket peer.
pub(crate) fn resolve_client_ip(headers: &HeaderMap, peer_ip: Option<IpAddr>) -> String {
    if let Some(forwarded) = parse_forwarded_ip(headers) {
        return forwarded.to_string();
    }
    peer_ip.map_or_else(|| String::from("unknown"), |ip| ip.to_string())
}

fn parse_forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .filter(|value| value.len() <= MAX_X_FORWARDED_FOR_HEADER_CHARS)
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty() && value.len() <= MAX_X_FORWARDED_FOR_ENTRY_CHARS)
        .and_then(|value| value.parse::<IpAddr>().ok())
}

pub(crate) fn outbound_event<T: Serialize>(event_type: &str, data: T) -> String {
    let Ok(event_type) = EventType::try_from(event_type.to_owned()) else {
        return String::from(r#"{"v":1,"t":"error","d":{}}"#);
    };
    let envelope = Envelope {
        v: PROTOCOL_VERSION,
        t: event_type,
        d: serde_json::to_value(data).unwrap_or(serde_json::Value::Null),
    };

    serde_json::to_string(&envelope)
        .unwrap_or_else(|_| String::from(r#"{"v":1,"t":"error","d":{}}"#))
}

pub(crate) fn conversation_group_key(conversation_id: &str) -> String {
    format!("conversation:{conversation_id}")
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderMap;

    use super::{enforce_auth_route_rate_limit, resolve_client_ip, validate_password};
    use crate::server::core::{AppConfig, AppState};

    #[test]
    fn password_length_bounds_are_enforced() {
        assert!(validate_password("correct-horse-battery").is_ok());
        assert!(validate_password("short").is_err());
        assert!(validate_password(&"a".repeat(129)).is_err());
    }

    #[test]
    fn client_ip_prefers_first_forwarded_entry() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            "198.51.100.44, 203.0.113.10".parse().expect("valid header"),
        );
        let resolved = resolve_client_ip(&headers, Some("10.2.0.8".parse().expect("valid ip")));
        assert_eq!(resolved, "198.51.100.44");
    }

    #[test]
    fn client_ip_falls_back_to_peer_on_malformed_forwarded_value() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            "198.51.100.44:80".parse().expect("valid header"),
        );
        let resolved = resolve_client_ip(&headers, Some("10.2.0.8".parse().expect("valid ip")));
        assert_eq!(resolved, "10.2.0.8");
    }

    #[tokio::test]
    async fn auth_rate_limit_sweep_prunes_stale_keys() {
        let state = AppState::new(&AppConfig::default()).expect("state should initialize");
        state
            .auth_route_hits
            .write()
            .await
            .insert(String::from("register:198.51.100.9"), vec![0]);

        enforce_auth_route_rate_limit(&state, "198.51.100.10", "register")
            .await
            .expect("rate limit should allow fresh key");

        let hits = state.auth_route_hits.read().await;
        assert!(
            !hits.contains_key("register:198.51.100.9"),
            "stale key should be swept"
        );
        assert!(
            hits.contains_key("register:198.51.100.10"),
            "fresh key should remain"
        );
    }

    #[tokio::test]
    async fn auth_rate_limit_rejects_when_window_is_full() {
        let config = AppConfig {
            auth_route_requests_per_minute: 2,
            ..AppConfig::default()
        };
        let state = AppState::new(&config).expect("state should initialize");

        for _ in 0..2 {
            enforce_auth_route_rate_limit(&state, "203.0.113.5", "login")
                .await
                .expect("within limit");
        }
        let rejected = enforce_auth_route_rate_limit(&state, "203.0.113.5", "login").await;
        assert!(rejected.is_err());
    }
}
