// Staged Batch - the per-transaction identity maps reconciliation works
// against, and the flush that turns them into SQL. One instance lives for
// exactly one unit of work and is discarded with it.

use std::collections::HashMap;

use afterburn_core::domain::JobId;
use afterburn_core::error::{AppError, Result};
use sqlx::SqliteConnection;

use crate::error_map::map_sqlx_error;
use crate::lookups::{self, ListRow};

/// Pending counter row. Increments and decrements of one key collapse into a
/// single algebraic sum; expiry is last-write-wins within the batch.
#[derive(Debug)]
pub(crate) struct CounterEntry {
    pub value: i64,
    pub expire_at: Option<i64>,
}

/// Pending set member, keyed by (key, value).
#[derive(Debug, Default)]
pub(crate) struct SetEntry {
    /// A row for this member is already persisted.
    pub exists: bool,
    pub deleted: bool,
    /// Set when an add touched the member: (score, created_at).
    pub score: Option<(f64, i64)>,
    /// Set when an expire or persist touched the member.
    pub expire_at: Option<Option<i64>>,
}

/// Pending hash field, keyed by (key, field).
#[derive(Debug, Default)]
pub(crate) struct HashEntry {
    pub exists: bool,
    pub deleted: bool,
    pub value: Option<String>,
    pub expire_at: Option<Option<i64>>,
}

/// Pending current-state pointer for one job.
#[derive(Debug)]
pub(crate) struct PointerEntry {
    /// A pointer row for this job is already persisted.
    pub exists: bool,
    pub state_id: i64,
    pub name: String,
}

#[derive(Debug, Clone)]
pub(crate) struct ListPending {
    pub value: String,
    pub expire_at: Option<i64>,
}

/// In-batch view of one list key.
///
/// Inserts only need the next free position, so they run against a cheap
/// max-position lookup. Remove, trim and expire materialize the full virtual
/// list (persisted snapshot plus staged appends); the flush then diffs the
/// virtual list against the snapshot, copying surviving values down onto the
/// lowest positions and deleting the surplus tail. Position key fields are
/// never renumbered in place.
#[derive(Debug, Default)]
pub(crate) struct ListKeyEntry {
    base: Vec<ListRow>,
    base_loaded: bool,
    base_len: Option<i64>,
    entries: Vec<ListPending>,
    materialized: bool,
}

impl ListKeyEntry {
    async fn ensure_base_len(&mut self, conn: &mut SqliteConnection, key: &str) -> Result<()> {
        if self.base_loaded || self.base_len.is_some() {
            return Ok(());
        }
        let max = lookups::max_list_position(conn, key).await?;
        self.base_len = Some(max.map(|p| p + 1).unwrap_or(0));
        Ok(())
    }

    /// Append a value after every position known to the batch.
    pub async fn push(
        &mut self,
        conn: &mut SqliteConnection,
        key: &str,
        value: String,
    ) -> Result<()> {
        self.ensure_base_len(conn, key).await?;
        self.entries.push(ListPending {
            value,
            expire_at: None,
        });
        Ok(())
    }

    /// Load the persisted snapshot and merge staged appends into one virtual
    /// list. Idempotent within the batch.
    pub async fn materialize(&mut self, conn: &mut SqliteConnection, key: &str) -> Result<()> {
        if self.materialized {
            return Ok(());
        }
        let base = lookups::list_rows(conn, key).await?;
        let appended = std::mem::take(&mut self.entries);
        self.entries = base
            .iter()
            .map(|row| ListPending {
                value: row.value.clone(),
                expire_at: row.expire_at,
            })
            .collect();
        self.entries.extend(appended);
        self.base_len = Some(base.len() as i64);
        self.base = base;
        self.base_loaded = true;
        self.materialized = true;
        Ok(())
    }

    /// Drop every occurrence of `value`. Requires a materialized view.
    pub fn remove_value(&mut self, value: &str) {
        self.entries.retain(|entry| entry.value != value);
    }

    /// Keep only the elements at indexes `keep_start..=keep_end`.
    pub fn trim(&mut self, keep_start: i64, keep_end: i64) {
        let mut index = -1i64;
        self.entries.retain(|_| {
            index += 1;
            index >= keep_start && index <= keep_end
        });
    }

    /// Stamp every known row with a new expiry.
    pub fn expire_all(&mut self, expire_at: Option<i64>) {
        for entry in &mut self.entries {
            entry.expire_at = expire_at;
        }
    }

    async fn flush(self, conn: &mut SqliteConnection, key: &str) -> Result<()> {
        if !self.materialized {
            // Insert-only key: append after the persisted tail.
            let start = self.base_len.unwrap_or(0);
            for (offset, entry) in self.entries.iter().enumerate() {
                insert_list_row(conn, key, start + offset as i64, entry).await?;
            }
            return Ok(());
        }

        let surviving = self.entries.len();
        for (index, entry) in self.entries.iter().enumerate() {
            match self.base.get(index) {
                Some(row) => {
                    if row.value != entry.value || row.expire_at != entry.expire_at {
                        sqlx::query(
                            "UPDATE lists SET value = ?, expire_at = ? WHERE key = ? AND position = ?",
                        )
                        .bind(&entry.value)
                        .bind(entry.expire_at)
                        .bind(key)
                        .bind(row.position)
                        .execute(&mut *conn)
                        .await
                        .map_err(map_sqlx_error)?;
                    }
                }
                None => insert_list_row(conn, key, index as i64, entry).await?,
            }
        }
        for row in &self.base[surviving.min(self.base.len())..] {
            sqlx::query("DELETE FROM lists WHERE key = ? AND position = ?")
                .bind(key)
                .bind(row.position)
                .execute(&mut *conn)
                .await
                .map_err(map_sqlx_error)?;
        }
        Ok(())
    }
}

async fn insert_list_row(
    conn: &mut SqliteConnection,
    key: &str,
    position: i64,
    entry: &ListPending,
) -> Result<()> {
    sqlx::query("INSERT INTO lists (key, position, value, expire_at) VALUES (?, ?, ?, ?)")
        .bind(key)
        .bind(position)
        .bind(&entry.value)
        .bind(entry.expire_at)
        .execute(conn)
        .await
        .map_err(map_sqlx_error)?;
    Ok(())
}

const UPSERT_COUNTER: &str = "INSERT INTO counters (key, value, expire_at) VALUES (?, ?, ?) \
     ON CONFLICT (key) DO UPDATE SET \
     value = counters.value + excluded.value, expire_at = excluded.expire_at";

/// The identity maps of one unit of work, keyed by natural key.
#[derive(Default)]
pub(crate) struct StagedBatch {
    pub counters: HashMap<String, CounterEntry>,
    pub sets: HashMap<(String, String), SetEntry>,
    pub hashes: HashMap<(String, String), HashEntry>,
    pub lists: HashMap<String, ListKeyEntry>,
    pub pointers: HashMap<JobId, PointerEntry>,
    pub job_expiries: HashMap<JobId, Option<i64>>,
}

impl StagedBatch {
    /// Translate every staged row into SQL against the open unit of work.
    /// Runs once, immediately before the transaction commits.
    pub async fn flush(self, conn: &mut SqliteConnection) -> Result<()> {
        for (key, entry) in self.counters {
            sqlx::query(UPSERT_COUNTER)
                .bind(&key)
                .bind(entry.value)
                .bind(entry.expire_at)
                .execute(&mut *conn)
                .await
                .map_err(map_sqlx_error)?;
        }

        for ((key, value), entry) in self.sets {
            flush_set_entry(conn, &key, &value, entry).await?;
        }

        for ((key, field), entry) in self.hashes {
            flush_hash_entry(conn, &key, &field, entry).await?;
        }

        for (key, entry) in self.lists {
            entry.flush(conn, &key).await?;
        }

        for (job_id, entry) in self.pointers {
            if entry.exists {
                sqlx::query("UPDATE job_states SET state_id = ?, name = ? WHERE job_id = ?")
                    .bind(entry.state_id)
                    .bind(&entry.name)
                    .bind(job_id)
                    .execute(&mut *conn)
                    .await
                    .map_err(map_sqlx_error)?;
            } else {
                sqlx::query("INSERT INTO job_states (job_id, state_id, name) VALUES (?, ?, ?)")
                    .bind(job_id)
                    .bind(entry.state_id)
                    .bind(&entry.name)
                    .execute(&mut *conn)
                    .await
                    .map_err(map_sqlx_error)?;
            }
            // Refresh the denormalized current-state reference on the job row.
            sqlx::query("UPDATE jobs SET state_id = ?, state_name = ? WHERE id = ?")
                .bind(entry.state_id)
                .bind(&entry.name)
                .bind(job_id)
                .execute(&mut *conn)
                .await
                .map_err(map_sqlx_error)?;
        }

        for (job_id, expire_at) in self.job_expiries {
            let result = sqlx::query("UPDATE jobs SET expire_at = ? WHERE id = ?")
                .bind(expire_at)
                .bind(job_id)
                .execute(&mut *conn)
                .await
                .map_err(map_sqlx_error)?;
            if result.rows_affected() == 0 {
                return Err(AppError::NotFound(format!("job {} not found", job_id)));
            }
        }

        Ok(())
    }
}

async fn flush_set_entry(
    conn: &mut SqliteConnection,
    key: &str,
    value: &str,
    entry: SetEntry,
) -> Result<()> {
    if entry.deleted {
        if entry.exists {
            sqlx::query("DELETE FROM sets WHERE key = ? AND value = ?")
                .bind(key)
                .bind(value)
                .execute(conn)
                .await
                .map_err(map_sqlx_error)?;
        }
        return Ok(());
    }
    if !entry.exists {
        // Staged inserts always carry a score.
        let Some((score, created_at)) = entry.score else {
            return Ok(());
        };
        sqlx::query(
            "INSERT INTO sets (key, value, score, created_at, expire_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(key)
        .bind(value)
        .bind(score)
        .bind(created_at)
        .bind(entry.expire_at.flatten())
        .execute(conn)
        .await
        .map_err(map_sqlx_error)?;
        return Ok(());
    }
    match (entry.score, entry.expire_at) {
        (None, None) => {}
        (Some((score, created_at)), None) => {
            sqlx::query("UPDATE sets SET score = ?, created_at = ? WHERE key = ? AND value = ?")
                .bind(score)
                .bind(created_at)
                .bind(key)
                .bind(value)
                .execute(conn)
                .await
                .map_err(map_sqlx_error)?;
        }
        (None, Some(expire_at)) => {
            sqlx::query("UPDATE sets SET expire_at = ? WHERE key = ? AND value = ?")
                .bind(expire_at)
                .bind(key)
                .bind(value)
                .execute(conn)
                .await
                .map_err(map_sqlx_error)?;
        }
        (Some((score, created_at)), Some(expire_at)) => {
            sqlx::query(
                "UPDATE sets SET score = ?, created_at = ?, expire_at = ? WHERE key = ? AND value = ?",
            )
            .bind(score)
            .bind(created_at)
            .bind(expire_at)
            .bind(key)
            .bind(value)
            .execute(conn)
            .await
            .map_err(map_sqlx_error)?;
        }
    }
    Ok(())
}

async fn flush_hash_entry(
    conn: &mut SqliteConnection,
    key: &str,
    field: &str,
    entry: HashEntry,
) -> Result<()> {
    if entry.deleted {
        if entry.exists {
            sqlx::query("DELETE FROM hashes WHERE key = ? AND field = ?")
                .bind(key)
                .bind(field)
                .execute(conn)
                .await
                .map_err(map_sqlx_error)?;
        }
        return Ok(());
    }
    if !entry.exists {
        // Staged inserts always carry a value.
        let Some(value) = entry.value else {
            return Ok(());
        };
        sqlx::query("INSERT INTO hashes (key, field, value, expire_at) VALUES (?, ?, ?, ?)")
            .bind(key)
            .bind(field)
            .bind(value)
            .bind(entry.expire_at.flatten())
            .execute(conn)
            .await
            .map_err(map_sqlx_error)?;
        return Ok(());
    }
    match (entry.value, entry.expire_at) {
        (None, None) => {}
        (Some(value), None) => {
            sqlx::query("UPDATE hashes SET value = ? WHERE key = ? AND field = ?")
                .bind(value)
                .bind(key)
                .bind(field)
                .execute(conn)
                .await
                .map_err(map_sqlx_error)?;
        }
        (None, Some(expire_at)) => {
            sqlx::query("UPDATE hashes SET expire_at = ? WHERE key = ? AND field = ?")
                .bind(expire_at)
                .bind(key)
                .bind(field)
                .execute(conn)
                .await
                .map_err(map_sqlx_error)?;
        }
        (Some(value), Some(expire_at)) => {
            sqlx::query("UPDATE hashes SET value = ?, expire_at = ? WHERE key = ? AND field = ?")
                .bind(value)
                .bind(expire_at)
                .bind(key)
                .bind(field)
                .execute(conn)
                .await
                .map_err(map_sqlx_error)?;
        }
    }
    Ok(())
}
