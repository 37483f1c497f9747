// Distributed Lock Rows
//
// Locks are taken and released by external callers around whole units of
// work; the transaction engine itself never mutates them.

use std::sync::Arc;
use std::time::Duration;

use afterburn_core::error::{AppError, Result};
use afterburn_core::port::TimeProvider;
use sqlx::SqlitePool;
use tracing::warn;

use crate::error_map::map_sqlx_error;

const MAX_LOCK_ID_LEN: usize = 100;

/// Named mutual-exclusion rows shared by every process using the store.
pub struct SqliteLock {
    pool: SqlitePool,
    time_provider: Arc<dyn TimeProvider>,
}

impl SqliteLock {
    pub fn new(pool: SqlitePool, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            pool,
            time_provider,
        }
    }

    /// Try to take the named lock. Returns false while another holder owns
    /// it. A holder older than `stale_after` is evicted first.
    pub async fn try_acquire(&self, id: &str, stale_after: Duration) -> Result<bool> {
        if id.is_empty() || id.len() > MAX_LOCK_ID_LEN {
            return Err(AppError::Validation(format!(
                "lock id must be 1..={} bytes",
                MAX_LOCK_ID_LEN
            )));
        }
        let now = self.time_provider.now_millis();
        let stale_before = now - stale_after.as_millis() as i64;

        let evicted = sqlx::query("DELETE FROM locks WHERE id = ? AND acquired_at < ?")
            .bind(id)
            .bind(stale_before)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        if evicted.rows_affected() > 0 {
            warn!(lock = id, "evicted stale lock holder");
        }

        let inserted =
            sqlx::query("INSERT INTO locks (id, acquired_at) VALUES (?, ?) ON CONFLICT (id) DO NOTHING")
                .bind(id)
                .bind(now)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        Ok(inserted.rows_affected() == 1)
    }

    pub async fn release(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM locks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool_with, run_migrations, StorageConfig};
    use afterburn_core::port::FixedTimeProvider;
    use sqlx::SqlitePool;

    async fn setup() -> SqlitePool {
        let pool = create_pool_with(&StorageConfig {
            max_connections: 1,
            ..Default::default()
        })
        .await
        .unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_until_released() {
        let pool = setup().await;
        let lock = SqliteLock::new(pool, Arc::new(FixedTimeProvider(1_000)));

        assert!(lock.try_acquire("recurring", Duration::from_secs(60)).await.unwrap());
        assert!(!lock.try_acquire("recurring", Duration::from_secs(60)).await.unwrap());

        lock.release("recurring").await.unwrap();
        assert!(lock.try_acquire("recurring", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_holder_is_evicted() {
        let pool = setup().await;
        let early = SqliteLock::new(pool.clone(), Arc::new(FixedTimeProvider(1_000)));
        assert!(early.try_acquire("sweep", Duration::from_secs(60)).await.unwrap());

        // One hour later the original holder counts as stale.
        let late = SqliteLock::new(pool, Arc::new(FixedTimeProvider(3_601_000)));
        assert!(late.try_acquire("sweep", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_out_of_range_ids() {
        let pool = setup().await;
        let lock = SqliteLock::new(pool, Arc::new(FixedTimeProvider(1_000)));

        assert!(lock.try_acquire("", Duration::from_secs(1)).await.is_err());
        let long_id = "x".repeat(101);
        assert!(lock.try_acquire(&long_id, Duration::from_secs(1)).await.is_err());
    }
}
