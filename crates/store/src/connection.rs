use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use switchboard_core::config::StoreConfig;

pub type StorePool = sqlx::SqlitePool;

pub async fn connect(store_url: &str) -> Result<StorePool, sqlx::Error> {
    connect_with_settings(store_url, 5, 30).await
}

pub async fn connect_with_config(config: &StoreConfig) -> Result<StorePool, sqlx::Error> {
    connect_with_settings(&config.url, config.max_connections, config.timeout_secs).await
}

/// File-backed URLs create the database file on first use.
pub async fn connect_with_settings(
    store_url: &str,
    max_connections: u32,
    timeout_secs: u64,
) -> Result<StorePool, sqlx::Error> {
    let options = normalize_url(store_url).parse::<SqliteConnectOptions>()?.create_if_missing(true);

    SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(timeout_secs.max(1)))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                sqlx::query("PRAGMA busy_timeout = 5000").execute(&mut *conn).await?;
                Ok(())
            })
        })
        .connect_with(options)
        .await
}

fn normalize_url(store_url: &str) -> &str {
    match store_url.trim() {
        ":memory:" => "sqlite::memory:",
        other => other,
    }
}
