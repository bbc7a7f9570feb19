//! Work queue seam and the bounded worker pool that drains it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use scout_core::JobTrigger;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::Engine;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkItem {
    Scrape {
        market_id: String,
        trigger: JobTrigger,
        #[serde(with = "delay_secs")]
        delay: Duration,
    },
    Verify {
        listing_id: Uuid,
    },
}

mod delay_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(delay: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(delay.as_secs())
    }
}

impl WorkItem {
    pub fn delay(&self) -> Duration {
        match self {
            WorkItem::Scrape { delay, .. } => *delay,
            WorkItem::Verify { .. } => Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("work queue is closed")]
    Closed,
}

/// Fire-and-forget hand-off of work to whatever executes it.
pub trait TaskQueue: Send + Sync {
    fn enqueue(&self, item: WorkItem) -> Result<(), QueueError>;
}

/// Queue backed by an unbounded channel; the receiver feeds a [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct ChannelQueue {
    tx: mpsc::UnboundedSender<WorkItem>,
}

impl ChannelQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WorkItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TaskQueue for ChannelQueue {
    fn enqueue(&self, item: WorkItem) -> Result<(), QueueError> {
        self.tx.send(item).map_err(|_| QueueError::Closed)
    }
}

/// Queue that buffers items until drained; used by one-shot runs and tests.
#[derive(Debug, Default)]
pub struct BufferedQueue {
    items: Mutex<Vec<WorkItem>>,
}

impl BufferedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<WorkItem> {
        match self.items.lock() {
            Ok(mut items) => std::mem::take(&mut *items),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    pub fn len(&self) -> usize {
        match self.items.lock() {
            Ok(items) => items.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TaskQueue for BufferedQueue {
    fn enqueue(&self, item: WorkItem) -> Result<(), QueueError> {
        match self.items.lock() {
            Ok(mut items) => items.push(item),
            Err(poisoned) => poisoned.into_inner().push(item),
        }
        Ok(())
    }
}

async fn execute_item(engine: Arc<Engine>, permits: Arc<Semaphore>, item: WorkItem, honor_delay: bool) {
    let delay = item.delay();
    if honor_delay && !delay.is_zero() {
        debug!(delay_secs = delay.as_secs(), "staggering work item");
        tokio::time::sleep(delay).await;
    }
    let Ok(_permit) = permits.acquire_owned().await else {
        warn!("worker pool closed before item could run");
        return;
    };
    if let Err(err) = engine.execute(item).await {
        error!(error = %err, "work item failed");
    }
}

/// Runs every queued item, including follow-up work the items enqueue, until the queue stays empty.
pub async fn run_until_idle(
    engine: Arc<Engine>,
    queue: &BufferedQueue,
    concurrency: usize,
    honor_delays: bool,
) -> usize {
    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut executed = 0;
    loop {
        let batch = queue.take();
        if batch.is_empty() {
            return executed;
        }
        executed += batch.len();
        let mut tasks = JoinSet::new();
        for item in batch {
            tasks.spawn(execute_item(engine.clone(), permits.clone(), item, honor_delays));
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "worker task panicked");
            }
        }
    }
}

/// Long-running pool: one task per item, at most `concurrency` executing at once.
pub struct WorkerPool {
    handle: JoinHandle<()>,
}

impl WorkerPool {
    pub fn start(
        engine: Arc<Engine>,
        mut rx: mpsc::UnboundedReceiver<WorkItem>,
        concurrency: usize,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(concurrency.max(1)));
        let handle = tokio::spawn(async move {
            info!(concurrency, "worker pool started");
            let mut tasks = JoinSet::new();
            loop {
                tokio::select! {
                    item = rx.recv() => match item {
                        Some(item) => {
                            tasks.spawn(execute_item(engine.clone(), permits.clone(), item, true));
                        }
                        None => break,
                    },
                    Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                        if let Err(err) = joined {
                            error!(error = %err, "worker task panicked");
                        }
                    }
                }
            }
            while let Some(joined) = tasks.join_next().await {
                if let Err(err) = joined {
                    error!(error = %err, "worker task panicked");
                }
            }
            info!("worker pool drained");
        });
        Self { handle }
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    pub async fn join(self) {
        if let Err(err) = self.handle.await {
            if !err.is_cancelled() {
                error!(error = %err, "worker pool task failed");
            }
        }
    }
}
