// Port Layer - Interfaces for external dependencies

pub mod queue;
pub mod time_provider;
pub mod transaction;

// Re-exports
pub use queue::{ExternalQueue, QueueDispatch, QueueProvider, QueueRoutes, TransactionalQueue};
pub use time_provider::{FixedTimeProvider, SystemTimeProvider, TimeProvider};
pub use transaction::WriteOnlyTransaction;
