// Write-Only Transaction port - the operation surface consumed by the
// job-processing core

use crate::domain::StateDraft;
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// A batch of deferred mutations committed as one atomic unit.
///
/// Every mutating method validates its arguments synchronously and stages a
/// typed command without touching the store; nothing is staged on a
/// validation failure. `add_to_queue` is async because enqueues routed to an
/// external broker are dispatched inline, outside the atomic boundary.
///
/// `commit` consumes the transaction, so use-after-commit cannot be
/// expressed; dropping an uncommitted transaction discards the batch with no
/// side effects.
#[async_trait]
pub trait WriteOnlyTransaction: Send {
    /// Append an immutable state history row for a job.
    fn add_job_state(&mut self, job_id: &str, state: StateDraft) -> Result<()>;

    /// Append a state history row and repoint the job's current state at it.
    fn set_job_state(&mut self, job_id: &str, state: StateDraft) -> Result<()>;

    /// Add a value to a scored set with score 0.
    fn add_to_set(&mut self, key: &str, value: &str) -> Result<()>;

    /// Add a value to a scored set with an explicit score.
    fn add_to_set_scored(&mut self, key: &str, value: &str, score: f64) -> Result<()>;

    /// Add every value to the set with score 0; duplicates collapse.
    fn add_range_to_set(&mut self, key: &str, values: &[String]) -> Result<()>;

    fn remove_from_set(&mut self, key: &str, value: &str) -> Result<()>;

    /// Remove every value stored under `key`.
    fn remove_set(&mut self, key: &str) -> Result<()>;

    fn increment_counter(&mut self, key: &str) -> Result<()>;

    fn increment_counter_with_expiry(&mut self, key: &str, expire_in: Duration) -> Result<()>;

    fn decrement_counter(&mut self, key: &str) -> Result<()>;

    fn decrement_counter_with_expiry(&mut self, key: &str, expire_in: Duration) -> Result<()>;

    /// Append a value at the next free position of the list.
    fn insert_to_list(&mut self, key: &str, value: &str) -> Result<()>;

    /// Remove every occurrence of `value`; surviving rows close ranks so
    /// positions stay dense from zero.
    fn remove_from_list(&mut self, key: &str, value: &str) -> Result<()>;

    /// Keep only the elements at indexes `keep_start..=keep_end`.
    fn trim_list(&mut self, key: &str, keep_start: i64, keep_end: i64) -> Result<()>;

    /// Overwrite the given fields of a hash.
    fn set_range_in_hash(&mut self, key: &str, pairs: &[(String, String)]) -> Result<()>;

    /// Remove every field stored under `key`.
    fn remove_hash(&mut self, key: &str) -> Result<()>;

    fn expire_job(&mut self, job_id: &str, expire_in: Duration) -> Result<()>;

    fn persist_job(&mut self, job_id: &str) -> Result<()>;

    fn expire_hash(&mut self, key: &str, expire_in: Duration) -> Result<()>;

    fn persist_hash(&mut self, key: &str) -> Result<()>;

    fn expire_list(&mut self, key: &str, expire_in: Duration) -> Result<()>;

    fn persist_list(&mut self, key: &str) -> Result<()>;

    fn expire_set(&mut self, key: &str, expire_in: Duration) -> Result<()>;

    fn persist_set(&mut self, key: &str) -> Result<()>;

    /// Route an enqueue through the provider configured for `queue`.
    ///
    /// A store-backed provider folds the row into this transaction's unit of
    /// work and wakes blocked fetchers after a successful commit; an external
    /// provider is called here, immediately, and is untouched by the
    /// transaction's atomicity.
    async fn add_to_queue(&mut self, queue: &str, job_id: &str) -> Result<()>;

    /// Open one unit of work, run every staged command in enqueue order,
    /// flush atomically, then run post-commit callbacks.
    async fn commit(self: Box<Self>) -> Result<()>;
}
