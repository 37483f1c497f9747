// SQLite Storage Facade

use std::sync::Arc;

use afterburn_core::error::Result;
use afterburn_core::port::{QueueRoutes, TimeProvider};
use sqlx::SqlitePool;

use crate::error_map::map_sqlx_error;
use crate::transaction::SqliteWriteOnlyTransaction;

/// Entry point handed to the job-processing core: wraps the pool, the clock
/// and the queue routing table, and hands out write-only transactions.
pub struct SqliteStorage {
    pool: SqlitePool,
    time_provider: Arc<dyn TimeProvider>,
    routes: Arc<QueueRoutes>,
}

impl SqliteStorage {
    pub fn new(
        pool: SqlitePool,
        time_provider: Arc<dyn TimeProvider>,
        routes: Arc<QueueRoutes>,
    ) -> Self {
        Self {
            pool,
            time_provider,
            routes,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Start a new write-only transaction. Nothing touches the store until
    /// commit.
    pub fn begin_write(&self) -> SqliteWriteOnlyTransaction {
        SqliteWriteOnlyTransaction::new(
            self.pool.clone(),
            Arc::clone(&self.time_provider),
            Arc::clone(&self.routes),
        )
    }

    /// Seed a job row and its parameters atomically. Returns the generated
    /// id as the decimal string callers use at every other boundary.
    pub async fn create_job(
        &self,
        payload: &str,
        parameters: &[(String, String)],
    ) -> Result<String> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let now = self.time_provider.now_millis();
        let id: i64 =
            sqlx::query_scalar("INSERT INTO jobs (created_at, payload) VALUES (?, ?) RETURNING id")
                .bind(now)
                .bind(payload)
                .fetch_one(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        for (name, value) in parameters {
            sqlx::query("INSERT INTO job_parameters (job_id, name, value) VALUES (?, ?, ?)")
                .bind(id)
                .bind(name)
                .bind(value)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        }
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(id.to_string())
    }
}
