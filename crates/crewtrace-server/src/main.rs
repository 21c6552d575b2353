use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use crewtrace_config::EngineConfig;
use crewtrace_monitor::StepStore;
use crewtrace_server::{router, ServerState};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .compact()
        .init();

    let config = EngineConfig::from_env().context("loading configuration")?;

    let db_path = Path::new(&config.server.database_path);
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating database directory {}", parent.display()))?;
    }
    let store = StepStore::new(db_path).context("opening step store")?;
    info!("Step store at {}", db_path.display());

    let addr = config.server.bind_addr.clone();
    let state = Arc::new(ServerState::new(config, Arc::new(store))?);
    let app = router(state);

    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
