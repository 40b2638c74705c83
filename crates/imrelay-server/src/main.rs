use anyhow::{Context, Result};
use clap::Parser;
use imrelay_server::Args;
use imrelay_store::{PresenceStore, SqliteStore};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "imrelay_server=info,imrelay_store=info".into()),
        )
        .init();

    let config = Args::parse().into_config()?;

    let store: Arc<dyn PresenceStore> = match &config.database {
        Some(path) => Arc::new(
            SqliteStore::open(path)
                .with_context(|| format!("failed to open database {}", path.display()))?,
        ),
        None => {
            tracing::warn!("no --database given, presence data will not survive a restart");
            Arc::new(SqliteStore::open_in_memory().context("failed to open in-memory database")?)
        }
    };

    imrelay_server::run(config, store).await
}
