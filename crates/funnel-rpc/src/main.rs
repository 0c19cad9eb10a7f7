use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use funnel_rpc::server::{build_router, store::ConversationStore, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "funnel_rpc=info,tower_http=debug".into()),
        )
        .init();

    let config = funnel_core::config::FunnelConfig::load(None)?;
    config.validate_for_state()?;

    if let Some(parent) = std::path::Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = ConversationStore::open(&config.database.path)?;
    let state = Arc::new(AppState::new(&config, store));
    let router = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.rpc.bind, config.rpc.port).parse()?;
    info!("funnel state store listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
