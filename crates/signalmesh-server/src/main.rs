//! # signalmesh-server
//!
//! The binary: loads configuration, bootstraps structured logging, assembles
//! the signalling gateway's router, and binds the listener.

use signalmesh_voice::GatewayState;
use std::net::SocketAddr;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = signalmesh_common::config::init()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "signalmesh=debug,tower_http=debug".into()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    tracing::info!("starting signalmesh v{}", env!("CARGO_PKG_VERSION"));

    let state = GatewayState::new();
    let router = signalmesh_voice::build_router(state);

    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("signalling gateway listening on http://{addr}");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
