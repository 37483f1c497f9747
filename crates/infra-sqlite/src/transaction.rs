// SQLite Write-Only Transaction
//
// Operations validate eagerly and stage typed commands; commit opens one
// unit of work, replays the commands in enqueue order against the staged
// batch, flushes once, then runs the collected post-commit wakes.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use afterburn_core::domain::{parse_job_id, JobId, StateDraft};
use afterburn_core::error::{AppError, Result};
use afterburn_core::port::{
    QueueDispatch, QueueRoutes, TimeProvider, TransactionalQueue, WriteOnlyTransaction,
};
use async_trait::async_trait;
use sqlx::{Sqlite, SqlitePool, Transaction as SqlxTransaction};
use tracing::debug;

use crate::error_map::map_sqlx_error;
use crate::lookups;
use crate::staged::{CounterEntry, HashEntry, PointerEntry, SetEntry, StagedBatch};

/// One deferred mutation, captured with everything it needs at commit time.
enum Command {
    AddJobState {
        job_id: JobId,
        state: StateDraft,
        set_current: bool,
    },
    AddToSet {
        key: String,
        value: String,
        score: f64,
    },
    AddRangeToSet {
        key: String,
        values: Vec<String>,
    },
    RemoveFromSet {
        key: String,
        value: String,
    },
    RemoveSet {
        key: String,
    },
    CounterDelta {
        key: String,
        delta: i64,
        expire_in: Option<Duration>,
    },
    InsertToList {
        key: String,
        value: String,
    },
    RemoveFromList {
        key: String,
        value: String,
    },
    TrimList {
        key: String,
        keep_start: i64,
        keep_end: i64,
    },
    SetRangeInHash {
        key: String,
        pairs: Vec<(String, String)>,
    },
    RemoveHash {
        key: String,
    },
    ExpireJob {
        job_id: JobId,
        expire_in: Option<Duration>,
    },
    ExpireHash {
        key: String,
        expire_in: Option<Duration>,
    },
    ExpireList {
        key: String,
        expire_in: Option<Duration>,
    },
    ExpireSet {
        key: String,
        expire_in: Option<Duration>,
    },
    Enqueue {
        queue: String,
        job_id: JobId,
        waker: Arc<dyn TransactionalQueue>,
    },
}

/// Write-only transaction against the SQLite store.
///
/// Built by [`crate::SqliteStorage::begin_write`]. A single logical caller
/// owns an instance; commit consumes it.
pub struct SqliteWriteOnlyTransaction {
    pool: SqlitePool,
    time_provider: Arc<dyn TimeProvider>,
    routes: Arc<QueueRoutes>,
    commands: Vec<Command>,
}

impl SqliteWriteOnlyTransaction {
    pub(crate) fn new(
        pool: SqlitePool,
        time_provider: Arc<dyn TimeProvider>,
        routes: Arc<QueueRoutes>,
    ) -> Self {
        Self {
            pool,
            time_provider,
            routes,
            commands: Vec::new(),
        }
    }

    fn stage_counter(&mut self, key: &str, delta: i64, expire_in: Option<Duration>) -> Result<()> {
        require("key", key)?;
        self.commands.push(Command::CounterDelta {
            key: key.to_string(),
            delta,
            expire_in,
        });
        Ok(())
    }

    fn stage_job_expiry(&mut self, job_id: &str, expire_in: Option<Duration>) -> Result<()> {
        let job_id = parse_job_id(job_id)?;
        self.commands.push(Command::ExpireJob { job_id, expire_in });
        Ok(())
    }
}

fn require(name: &'static str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(AppError::Validation(format!("{} must not be empty", name)));
    }
    Ok(())
}

#[async_trait]
impl WriteOnlyTransaction for SqliteWriteOnlyTransaction {
    fn add_job_state(&mut self, job_id: &str, state: StateDraft) -> Result<()> {
        let job_id = parse_job_id(job_id)?;
        require("state name", &state.name)?;
        self.commands.push(Command::AddJobState {
            job_id,
            state,
            set_current: false,
        });
        Ok(())
    }

    fn set_job_state(&mut self, job_id: &str, state: StateDraft) -> Result<()> {
        let job_id = parse_job_id(job_id)?;
        require("state name", &state.name)?;
        self.commands.push(Command::AddJobState {
            job_id,
            state,
            set_current: true,
        });
        Ok(())
    }

    fn add_to_set(&mut self, key: &str, value: &str) -> Result<()> {
        self.add_to_set_scored(key, value, 0.0)
    }

    fn add_to_set_scored(&mut self, key: &str, value: &str, score: f64) -> Result<()> {
        require("key", key)?;
        require("value", value)?;
        self.commands.push(Command::AddToSet {
            key: key.to_string(),
            value: value.to_string(),
            score,
        });
        Ok(())
    }

    fn add_range_to_set(&mut self, key: &str, values: &[String]) -> Result<()> {
        require("key", key)?;
        for value in values {
            require("value", value)?;
        }
        self.commands.push(Command::AddRangeToSet {
            key: key.to_string(),
            values: values.to_vec(),
        });
        Ok(())
    }

    fn remove_from_set(&mut self, key: &str, value: &str) -> Result<()> {
        require("key", key)?;
        require("value", value)?;
        self.commands.push(Command::RemoveFromSet {
            key: key.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    fn remove_set(&mut self, key: &str) -> Result<()> {
        require("key", key)?;
        self.commands.push(Command::RemoveSet {
            key: key.to_string(),
        });
        Ok(())
    }

    fn increment_counter(&mut self, key: &str) -> Result<()> {
        self.stage_counter(key, 1, None)
    }

    fn increment_counter_with_expiry(&mut self, key: &str, expire_in: Duration) -> Result<()> {
        self.stage_counter(key, 1, Some(expire_in))
    }

    fn decrement_counter(&mut self, key: &str) -> Result<()> {
        self.stage_counter(key, -1, None)
    }

    fn decrement_counter_with_expiry(&mut self, key: &str, expire_in: Duration) -> Result<()> {
        self.stage_counter(key, -1, Some(expire_in))
    }

    fn insert_to_list(&mut self, key: &str, value: &str) -> Result<()> {
        require("key", key)?;
        require("value", value)?;
        self.commands.push(Command::InsertToList {
            key: key.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    fn remove_from_list(&mut self, key: &str, value: &str) -> Result<()> {
        require("key", key)?;
        require("value", value)?;
        self.commands.push(Command::RemoveFromList {
            key: key.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    fn trim_list(&mut self, key: &str, keep_start: i64, keep_end: i64) -> Result<()> {
        require("key", key)?;
        self.commands.push(Command::TrimList {
            key: key.to_string(),
            keep_start,
            keep_end,
        });
        Ok(())
    }

    fn set_range_in_hash(&mut self, key: &str, pairs: &[(String, String)]) -> Result<()> {
        require("key", key)?;
        for (field, _) in pairs {
            require("field", field)?;
        }
        self.commands.push(Command::SetRangeInHash {
            key: key.to_string(),
            pairs: pairs.to_vec(),
        });
        Ok(())
    }

    fn remove_hash(&mut self, key: &str) -> Result<()> {
        require("key", key)?;
        self.commands.push(Command::RemoveHash {
            key: key.to_string(),
        });
        Ok(())
    }

    fn expire_job(&mut self, job_id: &str, expire_in: Duration) -> Result<()> {
        self.stage_job_expiry(job_id, Some(expire_in))
    }

    fn persist_job(&mut self, job_id: &str) -> Result<()> {
        self.stage_job_expiry(job_id, None)
    }

    fn expire_hash(&mut self, key: &str, expire_in: Duration) -> Result<()> {
        require("key", key)?;
        self.commands.push(Command::ExpireHash {
            key: key.to_string(),
            expire_in: Some(expire_in),
        });
        Ok(())
    }

    fn persist_hash(&mut self, key: &str) -> Result<()> {
        require("key", key)?;
        self.commands.push(Command::ExpireHash {
            key: key.to_string(),
            expire_in: None,
        });
        Ok(())
    }

    fn expire_list(&mut self, key: &str, expire_in: Duration) -> Result<()> {
        require("key", key)?;
        self.commands.push(Command::ExpireList {
            key: key.to_string(),
            expire_in: Some(expire_in),
        });
        Ok(())
    }

    fn persist_list(&mut self, key: &str) -> Result<()> {
        require("key", key)?;
        self.commands.push(Command::ExpireList {
            key: key.to_string(),
            expire_in: None,
        });
        Ok(())
    }

    fn expire_set(&mut self, key: &str, expire_in: Duration) -> Result<()> {
        require("key", key)?;
        self.commands.push(Command::ExpireSet {
            key: key.to_string(),
            expire_in: Some(expire_in),
        });
        Ok(())
    }

    fn persist_set(&mut self, key: &str) -> Result<()> {
        require("key", key)?;
        self.commands.push(Command::ExpireSet {
            key: key.to_string(),
            expire_in: None,
        });
        Ok(())
    }

    async fn add_to_queue(&mut self, queue: &str, job_id: &str) -> Result<()> {
        require("queue", queue)?;
        let job_id = parse_job_id(job_id)?;
        match self.routes.resolve(queue).dispatch() {
            QueueDispatch::Transactional(waker) => {
                self.commands.push(Command::Enqueue {
                    queue: queue.to_string(),
                    job_id,
                    waker,
                });
                Ok(())
            }
            // External brokers are outside the atomic boundary: dispatch now.
            QueueDispatch::External(broker) => broker.enqueue(queue, job_id).await,
        }
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        let commands = std::mem::take(&mut self.commands);
        debug!(commands = commands.len(), "committing write-only transaction");

        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let now = self.time_provider.now_millis();
        let mut staged = StagedBatch::default();
        let mut wakes: Vec<(Arc<dyn TransactionalQueue>, String)> = Vec::new();

        for command in commands {
            apply(command, &mut tx, &mut staged, &mut wakes, now).await?;
        }
        staged.flush(&mut *tx).await?;
        tx.commit().await.map_err(map_sqlx_error)?;

        // Post-commit callbacks run outside the atomic boundary and never
        // run after a failed commit.
        for (waker, queue) in wakes {
            waker.wake_fetchers(&queue);
        }
        Ok(())
    }
}

fn expiry_from(now: i64, expire_in: Option<Duration>) -> Option<i64> {
    expire_in.map(|d| now + d.as_millis() as i64)
}

/// Run one deferred command against the open unit of work, reconciling it
/// with the staged batch before deciding between insert, update and delete.
async fn apply(
    command: Command,
    tx: &mut SqlxTransaction<'_, Sqlite>,
    staged: &mut StagedBatch,
    wakes: &mut Vec<(Arc<dyn TransactionalQueue>, String)>,
    now: i64,
) -> Result<()> {
    match command {
        Command::AddJobState {
            job_id,
            state,
            set_current,
        } => {
            // History rows are append-only: write them eagerly and let
            // RETURNING hand back the id the pointer needs.
            let state_id: i64 = sqlx::query_scalar(
                "INSERT INTO states (job_id, name, reason, created_at, data) \
                 VALUES (?, ?, ?, ?, ?) RETURNING id",
            )
            .bind(job_id)
            .bind(&state.name)
            .bind(&state.reason)
            .bind(now)
            .bind(&state.data)
            .fetch_one(&mut **tx)
            .await
            .map_err(map_sqlx_error)?;

            if set_current {
                if let Some(entry) = staged.pointers.get_mut(&job_id) {
                    entry.state_id = state_id;
                    entry.name = state.name;
                } else {
                    let exists = lookups::job_state_exists(&mut **tx, job_id).await?;
                    staged.pointers.insert(
                        job_id,
                        PointerEntry {
                            exists,
                            state_id,
                            name: state.name,
                        },
                    );
                }
            }
        }

        Command::AddToSet { key, value, score } => {
            let natural = (key, value);
            if let Some(entry) = staged.sets.get_mut(&natural) {
                entry.deleted = false;
                entry.score = Some((score, now));
            } else {
                let exists = lookups::set_member_exists(&mut **tx, &natural.0, &natural.1).await?;
                staged.sets.insert(
                    natural,
                    SetEntry {
                        exists,
                        score: Some((score, now)),
                        ..Default::default()
                    },
                );
            }
        }

        Command::AddRangeToSet { key, values } => {
            let persisted: HashSet<String> =
                lookups::set_values(&mut **tx, &key).await?.into_iter().collect();
            for value in values {
                let natural = (key.clone(), value);
                if let Some(entry) = staged.sets.get_mut(&natural) {
                    entry.deleted = false;
                    continue;
                }
                let entry = if persisted.contains(&natural.1) {
                    // Already persisted: attach unchanged, no score reset.
                    SetEntry {
                        exists: true,
                        ..Default::default()
                    }
                } else {
                    SetEntry {
                        exists: false,
                        score: Some((0.0, now)),
                        ..Default::default()
                    }
                };
                staged.sets.insert(natural, entry);
            }
        }

        Command::RemoveFromSet { key, value } => {
            let natural = (key, value);
            if let Some(entry) = staged.sets.get_mut(&natural) {
                if entry.exists {
                    entry.deleted = true;
                    entry.score = None;
                    entry.expire_at = None;
                } else {
                    // Cancel the staged insert instead of deleting.
                    staged.sets.remove(&natural);
                }
            } else if lookups::set_member_exists(&mut **tx, &natural.0, &natural.1).await? {
                staged.sets.insert(
                    natural,
                    SetEntry {
                        exists: true,
                        deleted: true,
                        ..Default::default()
                    },
                );
            }
        }

        Command::RemoveSet { key } => {
            for value in lookups::set_values(&mut **tx, &key).await? {
                staged
                    .sets
                    .entry((key.clone(), value))
                    .or_insert_with(|| SetEntry {
                        exists: true,
                        ..Default::default()
                    });
            }
            let members: Vec<(String, String)> = staged
                .sets
                .keys()
                .filter(|(set_key, _)| *set_key == key)
                .cloned()
                .collect();
            for natural in members {
                if let Some(entry) = staged.sets.get_mut(&natural) {
                    if entry.exists {
                        entry.deleted = true;
                        entry.score = None;
                        entry.expire_at = None;
                    } else {
                        staged.sets.remove(&natural);
                    }
                }
            }
        }

        Command::ExpireSet { key, expire_in } => {
            let expire_at = expiry_from(now, expire_in);
            for value in lookups::set_values(&mut **tx, &key).await? {
                staged
                    .sets
                    .entry((key.clone(), value))
                    .or_insert_with(|| SetEntry {
                        exists: true,
                        ..Default::default()
                    });
            }
            for (natural, entry) in staged.sets.iter_mut() {
                if natural.0 != key || entry.deleted {
                    continue;
                }
                entry.expire_at = Some(expire_at);
            }
        }

        Command::CounterDelta {
            key,
            delta,
            expire_in,
        } => {
            let expire_at = expiry_from(now, expire_in);
            match staged.counters.get_mut(&key) {
                Some(entry) => {
                    entry.value += delta;
                    entry.expire_at = expire_at;
                }
                None => {
                    staged.counters.insert(
                        key,
                        CounterEntry {
                            value: delta,
                            expire_at,
                        },
                    );
                }
            }
        }

        Command::InsertToList { key, value } => {
            let entry = staged.lists.entry(key.clone()).or_default();
            entry.push(&mut **tx, &key, value).await?;
        }

        Command::RemoveFromList { key, value } => {
            let entry = staged.lists.entry(key.clone()).or_default();
            entry.materialize(&mut **tx, &key).await?;
            entry.remove_value(&value);
        }

        Command::TrimList {
            key,
            keep_start,
            keep_end,
        } => {
            let entry = staged.lists.entry(key.clone()).or_default();
            entry.materialize(&mut **tx, &key).await?;
            entry.trim(keep_start, keep_end);
        }

        Command::ExpireList { key, expire_in } => {
            let expire_at = expiry_from(now, expire_in);
            let entry = staged.lists.entry(key.clone()).or_default();
            entry.materialize(&mut **tx, &key).await?;
            entry.expire_all(expire_at);
        }

        Command::SetRangeInHash { key, pairs } => {
            let persisted: HashSet<String> =
                lookups::hash_fields(&mut **tx, &key).await?.into_iter().collect();
            for (field, value) in pairs {
                let natural = (key.clone(), field);
                if let Some(entry) = staged.hashes.get_mut(&natural) {
                    entry.deleted = false;
                    entry.value = Some(value);
                } else {
                    let exists = persisted.contains(&natural.1);
                    staged.hashes.insert(
                        natural,
                        HashEntry {
                            exists,
                            value: Some(value),
                            ..Default::default()
                        },
                    );
                }
            }
        }

        Command::RemoveHash { key } => {
            for field in lookups::hash_fields(&mut **tx, &key).await? {
                staged
                    .hashes
                    .entry((key.clone(), field))
                    .or_insert_with(|| HashEntry {
                        exists: true,
                        ..Default::default()
                    });
            }
            let fields: Vec<(String, String)> = staged
                .hashes
                .keys()
                .filter(|(hash_key, _)| *hash_key == key)
                .cloned()
                .collect();
            for natural in fields {
                if let Some(entry) = staged.hashes.get_mut(&natural) {
                    if entry.exists {
                        entry.deleted = true;
                        entry.value = None;
                        entry.expire_at = None;
                    } else {
                        staged.hashes.remove(&natural);
                    }
                }
            }
        }

        Command::ExpireHash { key, expire_in } => {
            let expire_at = expiry_from(now, expire_in);
            for field in lookups::hash_fields(&mut **tx, &key).await? {
                staged
                    .hashes
                    .entry((key.clone(), field))
                    .or_insert_with(|| HashEntry {
                        exists: true,
                        ..Default::default()
                    });
            }
            for (natural, entry) in staged.hashes.iter_mut() {
                if natural.0 != key || entry.deleted {
                    continue;
                }
                entry.expire_at = Some(expire_at);
            }
        }

        Command::ExpireJob { job_id, expire_in } => {
            let expire_at = expiry_from(now, expire_in);
            staged.job_expiries.insert(job_id, expire_at);
        }

        Command::Enqueue {
            queue,
            job_id,
            waker,
        } => {
            sqlx::query("INSERT INTO queued_jobs (queue, job_id) VALUES (?, ?)")
                .bind(&queue)
                .bind(job_id)
                .execute(&mut **tx)
                .await
                .map_err(map_sqlx_error)?;
            wakes.push((waker, queue));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool_with, run_migrations, SqliteQueueProvider, SqliteStorage, StorageConfig};
    use afterburn_core::port::FixedTimeProvider;

    const NOW: i64 = 1_000;

    async fn setup() -> SqliteStorage {
        let pool = create_pool_with(&StorageConfig {
            max_connections: 1,
            ..Default::default()
        })
        .await
        .unwrap();
        run_migrations(&pool).await.unwrap();
        let routes = QueueRoutes::new(Arc::new(SqliteQueueProvider::new()));
        SqliteStorage::new(pool, Arc::new(FixedTimeProvider(NOW)), Arc::new(routes))
    }

    #[tokio::test]
    async fn test_validation_failures_stage_nothing() {
        let storage = setup().await;
        let mut tx = storage.begin_write();

        assert!(tx.add_to_set("", "v").is_err());
        assert!(tx.insert_to_list("k", "").is_err());
        assert!(tx.set_range_in_hash("h", &[("".to_string(), "v".to_string())]).is_err());
        assert!(tx.add_job_state("0", StateDraft::new("Enqueued")).is_err());
        assert!(tx.add_job_state("17", StateDraft::new("")).is_err());
        assert!(tx.expire_job("not-a-number", Duration::from_secs(1)).is_err());

        assert!(tx.commands.is_empty());
        Box::new(tx).commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_counter_deltas_collapse_into_one_row() {
        let storage = setup().await;
        let mut tx = storage.begin_write();
        tx.increment_counter("stats:done").unwrap();
        tx.increment_counter("stats:done").unwrap();
        tx.decrement_counter("stats:done").unwrap();
        Box::new(tx).commit().await.unwrap();

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM counters")
            .fetch_one(storage.pool())
            .await
            .unwrap();
        let value: i64 = sqlx::query_scalar("SELECT value FROM counters WHERE key = 'stats:done'")
            .fetch_one(storage.pool())
            .await
            .unwrap();
        assert_eq!(rows, 1);
        assert_eq!(value, 1);
    }

    #[tokio::test]
    async fn test_counter_accumulates_across_transactions() {
        let storage = setup().await;
        for _ in 0..3 {
            let mut tx = storage.begin_write();
            tx.increment_counter("stats:retries").unwrap();
            Box::new(tx).commit().await.unwrap();
        }

        let value: i64 =
            sqlx::query_scalar("SELECT value FROM counters WHERE key = 'stats:retries'")
                .fetch_one(storage.pool())
                .await
                .unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn test_counter_expiry_is_last_write_wins() {
        let storage = setup().await;
        let mut tx = storage.begin_write();
        tx.increment_counter_with_expiry("stats:hour", Duration::from_secs(60)).unwrap();
        tx.increment_counter("stats:hour").unwrap();
        Box::new(tx).commit().await.unwrap();

        let expire_at: Option<i64> =
            sqlx::query_scalar("SELECT expire_at FROM counters WHERE key = 'stats:hour'")
                .fetch_one(storage.pool())
                .await
                .unwrap();
        assert_eq!(expire_at, None);
    }

    #[tokio::test]
    async fn test_failed_commit_persists_nothing() {
        let storage = setup().await;
        let mut tx = storage.begin_write();
        tx.increment_counter("stats:done").unwrap();
        // No such job: the flush must abort the whole unit of work.
        tx.expire_job("424242", Duration::from_secs(60)).unwrap();
        let err = Box::new(tx).commit().await;
        assert!(err.is_err());

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM counters")
            .fetch_one(storage.pool())
            .await
            .unwrap();
        assert_eq!(rows, 0);
    }
}
