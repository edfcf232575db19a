pub mod connection;
pub mod kv;
pub mod migrations;

use switchboard_core::config::StoreConfig;
use thiserror::Error;

pub use connection::{connect, connect_with_config, connect_with_settings, StorePool};
pub use kv::SqliteKvStore;

#[derive(Debug, Error)]
pub enum StoreSetupError {
    #[error("could not connect to store `{url}`: {source}")]
    Connect { url: String, source: sqlx::Error },
    #[error("store migrations failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Connects and applies pending migrations.
pub async fn open(config: &StoreConfig) -> Result<SqliteKvStore, StoreSetupError> {
    let pool = connect_with_config(config)
        .await
        .map_err(|source| StoreSetupError::Connect { url: config.url.clone(), source })?;
    migrations::run_pending(&pool).await?;
    tracing::info!(
        event_name = "store.opened",
        max_connections = config.max_connections,
        "key/value store ready"
    );
    Ok(SqliteKvStore::new(pool))
}
