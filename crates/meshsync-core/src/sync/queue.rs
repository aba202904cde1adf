//! Serialized work queues
//!
//! A [`WorkQueue`] runs one task at a time, in submission order, on a
//! dedicated tokio task. A failing task is logged and the queue moves on to
//! the next one.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};

/// Read-only view of a queue's outstanding task count
#[derive(Clone)]
pub struct QueueTracker {
    pending: watch::Receiver<usize>,
}

impl QueueTracker {
    /// Tasks waiting or running
    pub fn len(&self) -> usize {
        *self.pending.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve once no task is waiting or running
    pub async fn drained(&self) {
        let mut pending = self.pending.clone();
        let _ = pending.wait_for(|n| *n == 0).await;
    }
}

/// Concurrency-1 task queue
pub struct WorkQueue<T> {
    name: String,
    tx: mpsc::UnboundedSender<T>,
    pending: Arc<watch::Sender<usize>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> WorkQueue<T> {
    /// Spawn the worker. `handler` runs once per task.
    pub fn spawn<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SyncResult<()>> + Send + 'static,
    {
        let name = name.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<T>();
        let pending = Arc::new(watch::channel(0usize).0);

        let worker_pending = pending.clone();
        let worker_name = name.clone();
        let worker = tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                if let Err(e) = handler(task).await {
                    warn!(queue = %worker_name, error = %e, "Queue task failed");
                }
                worker_pending.send_modify(|n| *n = n.saturating_sub(1));
            }
            debug!(queue = %worker_name, "Queue worker stopped");
        });

        Self {
            name,
            tx,
            pending,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a task behind everything already submitted
    pub fn push(&self, task: T) -> SyncResult<()> {
        self.pending.send_modify(|n| *n += 1);
        if self.tx.send(task).is_err() {
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
            return Err(SyncError::QueueClosed(self.name.clone()));
        }
        Ok(())
    }

    /// Tasks waiting or running
    pub fn len(&self) -> usize {
        *self.pending.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tracker(&self) -> QueueTracker {
        QueueTracker {
            pending: self.pending.subscribe(),
        }
    }

    /// Resolve once no task is waiting or running
    pub async fn drained(&self) {
        self.tracker().drained().await
    }

    /// Abort the worker; queued tasks are dropped.
    pub fn shutdown(&self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }
}

impl<T> Drop for WorkQueue<T> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }
}
