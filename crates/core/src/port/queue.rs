// Queue Dispatch port - capability interface for enqueue routing

use crate::domain::JobId;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// How a provider wants enqueues routed. Providers state their capability
/// explicitly instead of being probed by concrete type.
#[derive(Clone)]
pub enum QueueDispatch {
    /// The queue lives in the engine's own store: the enqueue joins the
    /// transaction's unit of work and fetchers are woken after commit.
    Transactional(Arc<dyn TransactionalQueue>),

    /// The queue belongs to an opaque broker: the enqueue is issued
    /// immediately, outside the atomic boundary.
    External(Arc<dyn ExternalQueue>),
}

/// A provider responsible for one or more named queues.
pub trait QueueProvider: Send + Sync {
    fn dispatch(&self) -> QueueDispatch;
}

/// Store-backed queue capability.
pub trait TransactionalQueue: Send + Sync {
    /// Signal fetchers blocked on `queue`. Runs once per successful commit,
    /// never after a failed one; must tolerate spurious wakeups.
    fn wake_fetchers(&self, queue: &str);
}

/// External broker capability. Durability and ordering relative to the rest
/// of the transaction are the broker's responsibility.
#[async_trait]
pub trait ExternalQueue: Send + Sync {
    async fn enqueue(&self, queue: &str, job_id: JobId) -> Result<()>;
}

/// Injected mapping from queue name to provider, supplied by the caller at
/// wiring time. Unlisted queues fall back to the default provider.
pub struct QueueRoutes {
    default: Arc<dyn QueueProvider>,
    by_queue: HashMap<String, Arc<dyn QueueProvider>>,
}

impl QueueRoutes {
    pub fn new(default: Arc<dyn QueueProvider>) -> Self {
        Self {
            default,
            by_queue: HashMap::new(),
        }
    }

    pub fn route(mut self, queue: impl Into<String>, provider: Arc<dyn QueueProvider>) -> Self {
        self.by_queue.insert(queue.into(), provider);
        self
    }

    pub fn resolve(&self, queue: &str) -> &Arc<dyn QueueProvider> {
        self.by_queue.get(queue).unwrap_or(&self.default)
    }
}
