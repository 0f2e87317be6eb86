use loresync::{router_with_sync_state, DocumentStore, ServerConfig, SyncState};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env()?;
    info!("Starting loresync server...");

    let store = Arc::new(DocumentStore::new(
        &config.storage_path,
        config.compaction_threshold,
    ));
    let mut state = SyncState::new(store);
    match &config.access_token {
        Some(token) => state = state.with_access_token(token.clone()),
        None => info!("No access token configured, every client is accepted"),
    }

    let app = router_with_sync_state(state);

    let listener = TcpListener::bind(&config.bind_address).await?;
    info!("Storing documents under {:?}", config.storage_path);
    info!(
        "Sync endpoint available at ws://{}{}",
        config.bind_address,
        loresync::server::SYNC_PATH
    );

    axum::serve(listener, app).await?;
    Ok(())
}
