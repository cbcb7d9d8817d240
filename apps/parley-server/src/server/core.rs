use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, OnceLock},
    time::Duration,
};

use anyhow::anyhow;
use parley_core::{
    permissions::{ConversationPermissionSet, SystemPermissionSet},
    ConversationKind, ConversationRole, DeliveryState, MessageKind, UserId, Username,
};
use pasetors::{keys::SymmetricKey, version4::V4};
use rand::{rngs::OsRng, RngCore};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tokio::sync::{mpsc, watch, OnceCell, RwLock};
use uuid::Uuid;

use super::auth::hash_password;

pub(crate) type GroupSubscriptions = HashMap<Uuid, mpsc::Sender<String>>;
pub(crate) type Subscriptions = HashMap<String, GroupSubscriptions>;

pub const DEFAULT_JSON_BODY_LIMIT_BYTES: usize = 1_048_576;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_RATE_LIMIT_REQUESTS_PER_MINUTE: u32 = 60;
pub const DEFAULT_AUTH_ROUTE_REQUESTS_PER_MINUTE: u32 = 20;
pub const ACCESS_TOKEN_TTL_SECS: i64 = 15 * 60;
pub const DEFAULT_GATEWAY_INGRESS_EVENTS_PER_WINDOW: u32 = 20;
pub const DEFAULT_GATEWAY_INGRESS_WINDOW_SECS: u64 = 10;
pub const DEFAULT_GATEWAY_OUTBOUND_QUEUE: usize = 256;
pub const DEFAULT_MAX_GATEWAY_EVENT_BYTES: usize = parley_protocol::MAX_EVENT_BYTES;
pub const DEFAULT_STORE_TIMEOUT_MILLIS: u64 = 250;
pub const DEFAULT_MAX_CONVERSATION_MEMBERS: usize = 1_000;
pub(crate) const LOGIN_LOCK_THRESHOLD: u8 = 5;
pub(crate) const LOGIN_LOCK_SECS: i64 = 30;
pub(crate) const METRICS_TEXT_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

pub(crate) static METRICS_STATE: OnceLock<MetricsState> = OnceLock::new();

#[derive(Default)]
pub(crate) struct MetricsState {
    pub(crate) auth_failures: Mutex<HashMap<&'static str, u64>>,
    pub(crate) permission_denials: Mutex<HashMap<(&'static str, &'static str), u64>>,
    pub(crate) rate_limit_hits: Mutex<HashMap<(&'static str, &'static str), u64>>,
    pub(crate) ws_disconnects: Mutex<HashMap<&'static str, u64>>,
    pub(crate) gateway_events_emitted: Mutex<HashMap<(String, String), u64>>,
    pub(crate) gateway_events_dropped: Mutex<HashMap<(String, String, String), u64>>,
    pub(crate) gateway_events_parse_rejected: Mutex<HashMap<(String, String), u64>>,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub max_body_bytes: usize,
    pub request_timeout: Duration,
    pub rate_limit_requests_per_minute: u32,
    pub auth_route_requests_per_minute: u32,
    pub gateway_ingress_events_per_window: u32,
    pub gateway_ingress_window: Duration,
    pub gateway_outbound_queue: usize,
    pub max_gateway_event_bytes: usize,
    pub store_timeout: Duration,
    pub max_conversation_members: usize,
    pub database_url: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: DEFAULT_JSON_BODY_LIMIT_BYTES,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            rate_limit_requests_per_minute: DEFAULT_RATE_LIMIT_REQUESTS_PER_MINUTE,
            auth_route_requests_per_minute: DEFAULT_AUTH_ROUTE_REQUESTS_PER_MINUTE,
            gateway_ingress_events_per_window: DEFAULT_GATEWAY_INGRESS_EVENTS_PER_WINDOW,
            gateway_ingress_window: Duration::from_secs(DEFAULT_GATEWAY_INGRESS_WINDOW_SECS),
            gateway_outbound_queue: DEFAULT_GATEWAY_OUTBOUND_QUEUE,
            max_gateway_event_bytes: DEFAULT_MAX_GATEWAY_EVENT_BYTES,
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MILLIS),
            max_conversation_members: DEFAULT_MAX_CONVERSATION_MEMBERS,
            database_url: None,
        }
    }
}

#[derive(Clone)]
pub(crate) struct RuntimeSecurityConfig {
    pub(crate) auth_route_requests_per_minute: u32,
    pub(crate) gateway_ingress_events_per_window: u32,
    pub(crate) gateway_ingress_window: Duration,
    pub(crate) gateway_outbound_queue: usize,
    pub(crate) max_gateway_event_bytes: usize,
    pub(crate) store_timeout: Duration,
    pub(crate) max_conversation_members: usize,
}

#[derive(Clone)]
pub struct AppState {
    pub(crate) db_pool: Option<PgPool>,
    pub(crate) db_init: Arc<OnceCell<()>>,
    pub(crate) users: Arc<RwLock<HashMap<String, UserRecord>>>,
    pub(crate) user_ids: Arc<RwLock<HashMap<String, String>>>,
    pub(crate) token_key: Arc<SymmetricKey<V4>>,
    pub(crate) dummy_password_hash: Arc<String>,
    pub(crate) auth_route_hits: Arc<RwLock<HashMap<String, Vec<i64>>>>,
    pub(crate) user_overrides: Arc<RwLock<HashMap<String, SystemOverrideRecord>>>,
    pub(crate) system_roles: Arc<RwLock<HashMap<String, SystemRoleRecord>>>,
    pub(crate) user_roles: Arc<RwLock<HashMap<String, HashSet<String>>>>,
    pub(crate) conversations: Arc<RwLock<HashMap<String, ConversationRecord>>>,
    pub(crate) delivery_statuses: Arc<RwLock<HashMap<(String, String), DeliveryStatusRecord>>>,
    pub(crate) last_seen: Arc<RwLock<HashMap<String, i64>>>,
    pub(crate) audit_logs: Arc<RwLock<Vec<AuditLogRecord>>>,
    pub(crate) subscriptions: Arc<RwLock<Subscriptions>>,
    pub(crate) connection_senders: Arc<RwLock<HashMap<Uuid, mpsc::Sender<String>>>>,
    pub(crate) connection_controls: Arc<RwLock<HashMap<Uuid, watch::Sender<ConnectionControl>>>>,
    pub(crate) connection_presence: Arc<RwLock<HashMap<Uuid, ConnectionPresence>>>,
    pub(crate) runtime: Arc<RuntimeSecurityConfig>,
}

impl AppState {
    pub(crate) fn new(config: &AppConfig) -> anyhow::Result<Self> {
        let mut key_bytes = [0_u8; 32];
        OsRng.fill_bytes(&mut key_bytes);
        let token_key = SymmetricKey::<V4>::from(&key_bytes)
            .map_err(|e| anyhow!("token key init failed: {e}"))?;
        let dummy_password_hash = hash_password("parley-dummy-password")?;
        let db_pool = if let Some(database_url) = &config.database_url {
            Some(
                PgPoolOptions::new()
                    .max_connections(10)
                    .connect_lazy(database_url)
                    .map_err(|e| anyhow!("postgres pool init failed: {e}"))?,
            )
        } else {
            None
        };

        Ok(Self {
            db_pool,
            db_init: Arc::new(OnceCell::new()),
            users: Arc::new(RwLock::new(HashMap::new())),
            user_ids: Arc::new(RwLock::new(HashMap::new())),
            token_key: Arc::new(token_key),
            dummy_password_hash: Arc::new(dummy_password_hash),
            auth_route_hits: Arc::new(RwLock::new(HashMap::new())),
            user_overrides: Arc::new(RwLock::new(HashMap::new())),
            system_roles: Arc::new(RwLock::new(HashMap::new())),
            user_roles: Arc::new(RwLock::new(HashMap::new())),
            conversations: Arc::new(RwLock::new(HashMap::new())),
            delivery_statuses: Arc::new(RwLock::new(HashMap::new())),
            last_seen: Arc::new(RwLock::new(HashMap::new())),
            audit_logs: Arc::new(RwLock::new(Vec::new())),
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            connection_senders: Arc::new(RwLock::new(HashMap::new())),
            connection_controls: Arc::new(RwLock::new(HashMap::new())),
            connection_presence: Arc::new(RwLock::new(HashMap::new())),
            runtime: Arc::new(RuntimeSecurityConfig {
                auth_route_requests_per_minute: config.auth_route_requests_per_minute,
                gateway_ingress_events_per_window: config.gateway_ingress_events_per_window,
                gateway_ingress_window: config.gateway_ingress_window,
                gateway_outbound_queue: config.gateway_outbound_queue,
                max_gateway_event_bytes: config.max_gateway_event_bytes,
                store_timeout: config.store_timeout,
                max_conversation_members: config.max_conversation_members,
            }),
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct UserRecord {
    pub(crate) id: UserId,
    pub(crate) username: Username,
    pub(crate) password_hash: String,
    pub(crate) failed_logins: u8,
    pub(crate) locked_until_unix: Option<i64>,
}

/// Per-user system override row. The mask replaces the baseline outright.
#[derive(Debug, Clone)]
pub(crate) struct SystemOverrideRecord {
    pub(crate) mask: SystemPermissionSet,
    pub(crate) version: u64,
    pub(crate) updated_by: UserId,
    pub(crate) updated_at_unix: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct SystemRoleRecord {
    pub(crate) name: String,
    pub(crate) permissions: SystemPermissionSet,
    pub(crate) version: u64,
    pub(crate) active: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct ConversationRecord {
    pub(crate) kind: ConversationKind,
    pub(crate) name: Option<String>,
    pub(crate) created_by: UserId,
    pub(crate) created_at_unix: i64,
    pub(crate) active: bool,
    pub(crate) last_message_id: Option<String>,
    pub(crate) allow_members_to_add_others: bool,
    pub(crate) max_members: usize,
    pub(crate) members: HashMap<String, MembershipRecord>,
    pub(crate) messages: Vec<MessageRecord>,
    pub(crate) role_overrides: HashMap<ConversationRole, ConversationOverrideRecord>,
}

/// Per-(conversation, rank) override row. Applied verbatim when present.
#[derive(Debug, Clone)]
pub(crate) struct ConversationOverrideRecord {
    pub(crate) mask: ConversationPermissionSet,
    pub(crate) version: u64,
    pub(crate) updated_by: UserId,
    pub(crate) updated_at_unix: i64,
}

/// Membership rows are soft-deleted: `active` flips and `left_at_unix` is
/// set, the row itself survives for history and reactivation.
#[derive(Debug, Clone)]
pub(crate) struct MembershipRecord {
    pub(crate) user_id: UserId,
    pub(crate) role: ConversationRole,
    pub(crate) active: bool,
    pub(crate) joined_at_unix: i64,
    pub(crate) added_by: UserId,
    pub(crate) left_at_unix: Option<i64>,
    pub(crate) muted: bool,
    pub(crate) muted_until_unix: Option<i64>,
    pub(crate) last_read_message_id: Option<String>,
    pub(crate) last_read_at_unix: Option<i64>,
}

#[derive(Debug, Clone)]
pub(crate) struct MessageRecord {
    pub(crate) id: String,
    pub(crate) sender_id: UserId,
    pub(crate) kind: MessageKind,
    pub(crate) content: String,
    pub(crate) reply_to_message_id: Option<String>,
    pub(crate) created_at_unix: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct DeliveryStatusRecord {
    pub(crate) state: DeliveryState,
    pub(crate) updated_at_unix: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub(crate) struct AuditLogRecord {
    pub(crate) actor_id: String,
    pub(crate) action: String,
    pub(crate) entity: String,
    pub(crate) outcome: String,
    pub(crate) detail: serde_json::Value,
    pub(crate) created_at_unix: i64,
}

#[derive(Debug, Clone)]
pub(crate) struct AuthContext {
    pub(crate) user_id: UserId,
    pub(crate) username: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionControl {
    Open,
    Close,
}

#[derive(Debug, Clone)]
pub(crate) struct ConnectionPresence {
    pub(crate) user_id: UserId,
    pub(crate) conversation_ids: HashSet<String>,
}
