#![forbid(unsafe_code)]

use std::net::SocketAddr;

use parley_server::{build_router, init_tracing, AppConfig};
use tokio::net::TcpListener;

fn env_usize(name: &str, default: usize) -> anyhow::Result<usize> {
    std::env::var(name).map_or(Ok(default), |value| {
        value
            .parse::<usize>()
            .map_err(|e| anyhow::anyhow!("invalid {name} value {value:?}: {e}"))
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let defaults = AppConfig::default();
    let app_config = AppConfig {
        database_url: std::env::var("PARLEY_DATABASE_URL").ok(),
        max_conversation_members: env_usize(
            "PARLEY_MAX_CONVERSATION_MEMBERS",
            defaults.max_conversation_members,
        )?,
        gateway_outbound_queue: env_usize(
            "PARLEY_GATEWAY_OUTBOUND_QUEUE",
            defaults.gateway_outbound_queue,
        )?,
        ..defaults
    };
    let app = build_router(&app_config)?;
    let addr = std::env::var("PARLEY_BIND_ADDR")
        .unwrap_or_else(|_| String::from("0.0.0.0:3000"))
        .parse::<SocketAddr>()
        .map_err(|e| anyhow::anyhow!("invalid PARLEY_BIND_ADDR: {e}"))?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "parley-server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
