// Compiled Lookups - the targeted reads reconciliation runs against the
// open unit of work. Stateless by construction: const SQL plus free
// functions, reused across transactions through sqlx's per-connection
// statement cache.

use afterburn_core::domain::JobId;
use afterburn_core::error::Result;
use sqlx::SqliteConnection;

use crate::error_map::map_sqlx_error;

const HASH_FIELDS: &str = "SELECT field FROM hashes WHERE key = ?";

const SET_VALUES: &str = "SELECT value FROM sets WHERE key = ?";

const SET_MEMBER_EXISTS: &str =
    "SELECT EXISTS (SELECT 1 FROM sets WHERE key = ? AND value = ?)";

const LIST_ROWS: &str =
    "SELECT position, value, expire_at FROM lists WHERE key = ? ORDER BY position";

const MAX_LIST_POSITION: &str = "SELECT MAX(position) FROM lists WHERE key = ?";

const JOB_STATE_EXISTS: &str =
    "SELECT EXISTS (SELECT 1 FROM job_states WHERE job_id = ?)";

/// A persisted list row, fetched in position order.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct ListRow {
    pub position: i64,
    pub value: String,
    pub expire_at: Option<i64>,
}

/// Fields already persisted for a hash key.
pub(crate) async fn hash_fields(conn: &mut SqliteConnection, key: &str) -> Result<Vec<String>> {
    sqlx::query_scalar(HASH_FIELDS)
        .bind(key)
        .fetch_all(conn)
        .await
        .map_err(map_sqlx_error)
}

/// Values already persisted for a set key.
pub(crate) async fn set_values(conn: &mut SqliteConnection, key: &str) -> Result<Vec<String>> {
    sqlx::query_scalar(SET_VALUES)
        .bind(key)
        .fetch_all(conn)
        .await
        .map_err(map_sqlx_error)
}

pub(crate) async fn set_member_exists(
    conn: &mut SqliteConnection,
    key: &str,
    value: &str,
) -> Result<bool> {
    let found: i64 = sqlx::query_scalar(SET_MEMBER_EXISTS)
        .bind(key)
        .bind(value)
        .fetch_one(conn)
        .await
        .map_err(map_sqlx_error)?;
    Ok(found != 0)
}

/// Every persisted row of a list, ordered by position.
pub(crate) async fn list_rows(conn: &mut SqliteConnection, key: &str) -> Result<Vec<ListRow>> {
    sqlx::query_as(LIST_ROWS)
        .bind(key)
        .fetch_all(conn)
        .await
        .map_err(map_sqlx_error)
}

pub(crate) async fn max_list_position(
    conn: &mut SqliteConnection,
    key: &str,
) -> Result<Option<i64>> {
    sqlx::query_scalar(MAX_LIST_POSITION)
        .bind(key)
        .fetch_one(conn)
        .await
        .map_err(map_sqlx_error)
}

/// Whether a job already has a current-state pointer row.
pub(crate) async fn job_state_exists(conn: &mut SqliteConnection, job_id: JobId) -> Result<bool> {
    let found: i64 = sqlx::query_scalar(JOB_STATE_EXISTS)
        .bind(job_id)
        .fetch_one(conn)
        .await
        .map_err(map_sqlx_error)?;
    Ok(found != 0)
}
