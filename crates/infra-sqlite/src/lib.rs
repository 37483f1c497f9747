// Afterburn Infrastructure - SQLite Adapter
// Implements: WriteOnlyTransaction, the store-backed QueueProvider, lock rows

mod connection;
mod error_map;
mod lock;
mod lookups;
mod migration;
mod queue;
mod staged;
mod storage;
mod transaction;

pub use connection::{create_pool, create_pool_with, StorageConfig};
pub use lock::SqliteLock;
pub use migration::run_migrations;
pub use queue::SqliteQueueProvider;
pub use storage::SqliteStorage;
pub use transaction::SqliteWriteOnlyTransaction;

// Note: sqlx::Error conversion is handled by a crate-private helper
// due to Rust's orphan rules (cannot implement From<sqlx::Error> for AppError here)
