use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};
use translation_reconciler::{
    api::{self, AppState},
    config::Config,
    db::Database,
    host::HostClient,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (ignored in production)
    let _ = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("translation_reconciler=info,tower_http=info")
            }),
        )
        .init();

    info!("Starting translation reconciler");

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        "Project {} ({}), source language {}",
        config.project_id, config.environment, config.source_language
    );
    if config.is_production() && config.api_key.is_none() {
        warn!("API_KEY is not set, the API accepts every caller");
    }

    let db = Database::connect(&config.database_url)
        .await
        .context("Failed to open database")?;
    let host = HostClient::from_config(&config).context("Failed to build host client")?;

    let bind_addr = format!("0.0.0.0:{}", config.port);
    let state = Arc::new(AppState::new(config, db.clone(), host));

    api::serve(state, &bind_addr).await?;

    db.close().await;
    Ok(())
}
