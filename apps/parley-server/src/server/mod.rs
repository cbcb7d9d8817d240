pub(crate) mod auth;
pub(crate) mod core;
pub(crate) mod db;
pub(crate) mod errors;
pub(crate) mod gateway_events;
pub(crate) mod handlers;
pub(crate) mod metrics;
pub(crate) mod permissions;
pub(crate) mod realtime;
pub(crate) mod registry;
pub(crate) mod router;
pub(crate) mod store;
pub(crate) mod types;

pub use core::{AppConfig, ACCESS_TOKEN_TTL_SECS};
pub use errors::init_tracing;
pub use router::build_router;
