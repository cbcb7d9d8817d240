use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::anyhow;
use axum::{
    extract::{ConnectInfo, DefaultBodyLimit},
    http::{request::Request, HeaderName, StatusCode},
    routing::{delete, get, post, put},
    Router,
};
use tower::ServiceBuilder;
use tower_governor::{
    errors::GovernorError, governor::GovernorConfigBuilder, key_extractor::KeyExtractor,
    GovernorLayer,
};
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use super::{
    auth::resolve_client_ip,
    core::{AppConfig, AppState},
    handlers::{
        auth::{login, me, register},
        conversations::{
            add_member, create_direct, create_group, list_conversations, list_members,
            remove_member, update_rank_permissions,
        },
        permissions::{
            assign_role_to_user, create_system_role, get_user_permissions, grant_permission,
            remove_role_from_user, revoke_permission, update_system_role_permissions,
        },
    },
    realtime::gateway_ws,
    types::{health, metrics},
};

#[derive(Clone)]
struct ClientIpKeyExtractor;

impl KeyExtractor for ClientIpKeyExtractor {
    type Key = String;

    fn extract<T>(&self, req: &Request<T>) -> Result<Self::Key, GovernorError> {
        let peer_ip = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|value| value.0.ip())
            .or_else(|| req.extensions().get::<SocketAddr>().map(SocketAddr::ip));
        Ok(resolve_client_ip(req.headers(), peer_ip))
    }
}

/// Build the axum router with global security middleware.
///
/// # Errors
/// Returns an error if configured security limits are invalid.
pub fn build_router(config: &AppConfig) -> anyhow::Result<Router> {
    if config.max_gateway_event_bytes > parley_protocol::MAX_EVENT_BYTES {
        return Err(anyhow!(
            "gateway event limit cannot exceed protocol max of {} bytes",
            parley_protocol::MAX_EVENT_BYTES
        ));
    }
    if config.rate_limit_requests_per_minute == 0 {
        return Err(anyhow!("rate limit must be at least 1 request per minute"));
    }
    if config.auth_route_requests_per_minute == 0 {
        return Err(anyhow!(
            "auth route rate limit must be at least 1 request per minute"
        ));
    }
    if config.gateway_ingress_events_per_window == 0 {
        return Err(anyhow!(
            "gateway ingress limit must be at least 1 event per window"
        ));
    }
    if config.gateway_outbound_queue == 0 {
        return Err(anyhow!(
            "gateway outbound queue must hold at least 1 event"
        ));
    }
    if config.store_timeout.is_zero() {
        return Err(anyhow!("store timeout must be nonzero"));
    }
    if config.max_conversation_members < 2 {
        return Err(anyhow!(
            "conversation member capacity must allow at least 2 members"
        ));
    }

    let governor_config = Arc::new(
        GovernorConfigBuilder::default()
            .period(Duration::from_secs(60))
            .burst_size(config.rate_limit_requests_per_minute)
            .key_extractor(ClientIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow!("invalid governor configuration"))?,
    );
    let app_state = AppState::new(config)?;
    let request_id_header = HeaderName::from_static("x-request-id");
    let governor_layer = GovernorLayer::new(governor_config);

    let routes = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/me", get(me))
        .route("/conversations", get(list_conversations))
        .route("/conversations/direct", post(create_direct))
        .route("/conversations/group", post(create_group))
        .route(
            "/conversations/{conversation_id}/members",
            get(list_members).post(add_member),
        )
        .route(
            "/conversations/{conversation_id}/members/{user_id}",
            delete(remove_member),
        )
        .route(
            "/conversations/{conversation_id}/permissions/{rank}",
            put(update_rank_permissions),
        )
        .route("/users/{user_id}/permissions", get(get_user_permissions))
        .route(
            "/users/{user_id}/permissions/grant",
            post(grant_permission),
        )
        .route(
            "/users/{user_id}/permissions/revoke",
            post(revoke_permission),
        )
        .route("/roles", post(create_system_role))
        .route(
            "/roles/{role_id}/permissions",
            put(update_system_role_permissions),
        )
        .route(
            "/users/{user_id}/roles/{role_id}",
            post(assign_role_to_user).delete(remove_role_from_user),
        )
        .route("/gateway", get(gateway_ws));

    Ok(routes
        .with_state(app_state)
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
                .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    config.request_timeout,
                ))
                .layer(governor_layer),
        ))
}
