//! Applies pending schema migrations to the database named by `DATABASE_URL`.

use anyhow::Context;

use conversation_store::{AdapterOptions, LibSqlAdapter, StorageAdapter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let options = AdapterOptions::from_env().context("reading database configuration")?;

    let adapter = LibSqlAdapter::new(&options)
        .await
        .with_context(|| format!("opening database at {}", options.connection_string))?;

    adapter.init().await?;

    let version = adapter.schema_version().await?;
    tracing::info!(version, "Schema is up to date");
    Ok(())
}
