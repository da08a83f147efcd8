//! Ordered completion queue.
//!
//! Host callbacks must return quickly and must not race each other, so the
//! rename/delete/close completions are turned into deferred actions and
//! executed one at a time, strictly in arrival order, by a single consumer
//! task.
//!
//! A failing or panicking action is logged and does not stop the consumer.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot};

use crate::SyncError;

/// A deferred action waiting in the queue
pub struct QueuedCompletion {
    /// Short description used in logs
    pub label: String,
    /// When the action was enqueued
    pub enqueued_at: Instant,
    action: BoxFuture<'static, anyhow::Result<()>>,
}

enum QueueMessage {
    Run(QueuedCompletion),
    Flush(oneshot::Sender<()>),
}

// ============================================================================
// CompletionQueueHandle
// ============================================================================

/// Handle for submitting deferred actions
///
/// This handle can be cloned and shared; all actions from all clones are
/// executed by the same consumer.
#[derive(Clone)]
pub struct CompletionQueueHandle {
    tx: mpsc::UnboundedSender<QueueMessage>,
}

impl CompletionQueueHandle {
    /// Appends an action to the queue without waiting for it to run
    pub fn enqueue<F>(&self, label: impl Into<String>, action: F) -> Result<(), SyncError>
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let completion = QueuedCompletion {
            label: label.into(),
            enqueued_at: Instant::now(),
            action: Box::pin(action),
        };
        self.tx
            .send(QueueMessage::Run(completion))
            .map_err(|_| SyncError::QueueClosed("completion queue"))
    }

    /// Waits until every action enqueued before this call has finished
    pub async fn flush(&self) -> Result<(), SyncError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(QueueMessage::Flush(tx))
            .map_err(|_| SyncError::QueueClosed("completion queue"))?;
        rx.await
            .map_err(|_| SyncError::QueueClosed("completion queue"))
    }
}

// ============================================================================
// CompletionQueue
// ============================================================================

/// Single consumer of the deferred actions
pub struct CompletionQueue {
    rx: mpsc::UnboundedReceiver<QueueMessage>,
}

impl CompletionQueue {
    /// Creates the queue and its submission handle
    ///
    /// The caller must spawn [`run`](CompletionQueue::run).
    pub fn new() -> (Self, CompletionQueueHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rx }, CompletionQueueHandle { tx })
    }

    /// Executes actions in order until every handle has been dropped
    pub async fn run(mut self) {
        tracing::info!("Completion queue started");

        let mut executed: u64 = 0;
        while let Some(message) = self.rx.recv().await {
            match message {
                QueueMessage::Run(completion) => {
                    Self::execute(completion).await;
                    executed += 1;
                }
                QueueMessage::Flush(reply) => {
                    let _ = reply.send(());
                }
            }
        }

        tracing::info!(executed, "Completion queue stopped (all handles dropped)");
    }

    async fn execute(completion: QueuedCompletion) {
        let QueuedCompletion {
            label,
            enqueued_at,
            action,
        } = completion;

        let waited_ms = enqueued_at.elapsed().as_millis() as u64;
        tracing::trace!(label = %label, waited_ms, "Running queued completion");

        match AssertUnwindSafe(action).catch_unwind().await {
            Ok(Ok(())) => {
                tracing::debug!(label = %label, "Queued completion finished");
            }
            Ok(Err(e)) => {
                tracing::warn!(label = %label, error = %format!("{e:#}"), "Queued completion failed");
            }
            Err(_) => {
                tracing::error!(label = %label, "Queued completion panicked");
            }
        }
    }
}
