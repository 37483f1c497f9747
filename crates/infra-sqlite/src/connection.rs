// SQLite Connection Pool Setup

use afterburn_core::error::Result;
use serde::Deserialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::error_map::map_sqlx_error;

/// Pool settings, deserializable from the host application's configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub busy_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            max_connections: 10,
            busy_timeout_secs: 5,
        }
    }
}

/// Create SQLite connection pool with WAL mode and default settings
pub async fn create_pool(database_url: &str) -> Result<SqlitePool> {
    create_pool_with(&StorageConfig {
        database_url: database_url.to_string(),
        ..Default::default()
    })
    .await
}

/// Create SQLite connection pool from explicit settings
pub async fn create_pool_with(config: &StorageConfig) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&config.database_url)
        .map_err(map_sqlx_error)?
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(config.busy_timeout_secs))
        // Enforced per connection, so it must be part of the options
        .foreign_keys(true)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await
        .map_err(map_sqlx_error)?;

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_pool() {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        assert!(pool.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_config_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.busy_timeout_secs, 5);

        let pool = create_pool_with(&StorageConfig {
            max_connections: 1,
            ..Default::default()
        })
        .await
        .unwrap();
        assert!(pool.acquire().await.is_ok());
    }
}
