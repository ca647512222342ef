//! Ordered delivery queue.
//!
//! A bounded channel of futures drained by a single worker task. Task *i+1*
//! is not polled until task *i* has run to completion, including any
//! rendering it awaits, so bursty arrivals are processed strictly in order.
//! A task that panics is logged and skipped; the worker carries on with the
//! next one.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// The queue no longer accepts tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed;

impl fmt::Display for QueueClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("delivery queue closed")
    }
}

impl std::error::Error for QueueClosed {}

/// Single-consumer FIFO of async tasks.
pub struct OrderedQueue {
    tx: Mutex<Option<mpsc::Sender<Task>>>,
    pending: Arc<AtomicUsize>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for OrderedQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderedQueue")
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

impl OrderedQueue {
    /// Spawn the worker. `capacity` bounds how many tasks may wait.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Task>(capacity.max(1));
        let pending = Arc::new(AtomicUsize::new(0));
        let worker_pending = Arc::clone(&pending);

        let worker = tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
                    log::error!("[Queue] Task panicked: {}", panic_message(panic.as_ref()));
                }
                worker_pending.fetch_sub(1, Ordering::SeqCst);
            }
            log::debug!("[Queue] Worker drained and stopped");
        });

        Self {
            tx: Mutex::new(Some(tx)),
            pending,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Enqueue a task, waiting while the queue is full.
    pub async fn push<F>(&self, task: F) -> Result<(), QueueClosed>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let tx = self.sender().ok_or(QueueClosed)?;
        self.pending.fetch_add(1, Ordering::SeqCst);
        if tx.send(Box::pin(task)).await.is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(QueueClosed);
        }
        Ok(())
    }

    /// Wait until every task pushed before this call has finished.
    pub async fn flush(&self) -> Result<(), QueueClosed> {
        let (done_tx, done_rx) = oneshot::channel();
        self.push(async move {
            let _ = done_tx.send(());
        })
        .await?;
        done_rx.await.map_err(|_| QueueClosed)
    }

    /// Tasks enqueued or running.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Stop accepting tasks, let the worker finish what is queued, and wait for it.
    pub async fn close(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                log::warn!("[Queue] Worker failed: {}", e);
            }
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<Task>> {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        *msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}
