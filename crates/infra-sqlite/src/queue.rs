// Store-Backed Queue Provider

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use afterburn_core::port::{QueueDispatch, QueueProvider, TransactionalQueue};
use tokio::sync::Notify;

/// Queue provider backed by the engine's own store.
///
/// Enqueued rows commit with the surrounding transaction; fetchers blocked
/// in [`SqliteQueueProvider::notified`] are signalled once per successful
/// commit. A signal with no fetcher waiting is kept as a permit, so a
/// fetcher that arrives late does not miss it.
#[derive(Clone, Default)]
pub struct SqliteQueueProvider {
    inner: Arc<QueueWaiters>,
}

impl SqliteQueueProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until a new item lands on `queue`. Wakeups can be spurious;
    /// the fetcher re-polls the store after each one.
    pub async fn notified(&self, queue: &str) {
        let notify = self.inner.waiter(queue);
        notify.notified().await;
    }
}

impl QueueProvider for SqliteQueueProvider {
    fn dispatch(&self) -> QueueDispatch {
        QueueDispatch::Transactional(self.inner.clone())
    }
}

#[derive(Default)]
struct QueueWaiters {
    waiters: Mutex<HashMap<String, Arc<Notify>>>,
}

impl QueueWaiters {
    fn waiter(&self, queue: &str) -> Arc<Notify> {
        let mut map = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(queue.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }
}

impl TransactionalQueue for QueueWaiters {
    fn wake_fetchers(&self, queue: &str) {
        self.waiter(queue).notify_one();
    }
}
