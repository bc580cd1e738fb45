//! Asynchronous work queue for recompute tasks
//!
//! A pool of tokio workers pulls keyed tasks off a shared channel and runs
//! the aggregation coordinator with a hard per-task timeout. Supports
//! delayed submission (the ingestion debounce), contention re-enqueue, and
//! bounded retry with backoff.
//!
//! Tasks for the same station carry no state and may execute in any order
//! across workers; each recompute reads current entry state, so redundant
//! or reordered triggers converge to the same result. Triggers are
//! deliberately not coalesced or deduplicated — idempotence already makes
//! duplicates harmless, and dropping one risks a lost-trigger bug.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::ballot::StationId;
use crate::config::TallyConfig;
use crate::coordinator::{Coordinator, RecomputeOutcome};
use crate::metrics::TallyMetrics;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("work queue is shut down")]
    ShutDown,
}

/// One recompute trigger. A pure trigger: no payload beyond the key and the
/// execution-attempt counter the retry policy needs.
#[derive(Debug, Clone, Copy)]
struct RecomputeTask {
    station: StationId,
    /// Failed execution attempts so far. Contention re-enqueues do not
    /// increment this.
    attempt: usize,
}

enum QueueMessage {
    Task(RecomputeTask),
    /// Stops exactly one worker; used to drain the pool on shutdown.
    Stop,
}

/// Cheap cloneable submitter into the queue.
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::UnboundedSender<QueueMessage>,
}

impl QueueHandle {
    /// Submit a recompute trigger immediately.
    pub fn submit(&self, station: StationId) -> Result<(), QueueError> {
        self.send(RecomputeTask {
            station,
            attempt: 0,
        })
    }

    /// Submit a recompute trigger after a delay (the debounce window).
    pub fn submit_after(&self, station: StationId, delay: Duration) -> Result<(), QueueError> {
        self.send_after(
            RecomputeTask {
                station,
                attempt: 0,
            },
            delay,
        )
    }

    fn send(&self, task: RecomputeTask) -> Result<(), QueueError> {
        self.tx
            .send(QueueMessage::Task(task))
            .map_err(|_| QueueError::ShutDown)
    }

    fn send_after(&self, task: RecomputeTask, delay: Duration) -> Result<(), QueueError> {
        if self.tx.is_closed() {
            return Err(QueueError::ShutDown);
        }
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Queue shut down while the delay ran; nothing left to trigger
            let _ = tx.send(QueueMessage::Task(task));
        });
        Ok(())
    }
}

/// Worker pool executing recompute tasks.
pub struct WorkQueue {
    handle: QueueHandle,
    workers: Vec<JoinHandle<()>>,
}

impl WorkQueue {
    /// Spawn the worker pool.
    pub fn start(
        coordinator: Arc<Coordinator>,
        config: TallyConfig,
        metrics: Arc<TallyMetrics>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let handle = QueueHandle { tx };

        let workers = (0..config.workers.max(1))
            .map(|worker_id| {
                let rx = Arc::clone(&rx);
                let coordinator = Arc::clone(&coordinator);
                let metrics = Arc::clone(&metrics);
                let handle = handle.clone();
                let config = config.clone();
                tokio::spawn(async move {
                    debug!(worker_id, "queue worker started");
                    loop {
                        let message = { rx.lock().await.recv().await };
                        match message {
                            Some(QueueMessage::Task(task)) => {
                                execute(&coordinator, &config, &metrics, &handle, task).await;
                            }
                            Some(QueueMessage::Stop) | None => {
                                debug!(worker_id, "queue worker stopping");
                                break;
                            }
                        }
                    }
                })
            })
            .collect();

        info!(workers = config.workers.max(1), "work queue started");
        Self { handle, workers }
    }

    /// Submitter handle for producers.
    pub fn handle(&self) -> QueueHandle {
        self.handle.clone()
    }

    /// Drain queued tasks and stop the workers.
    ///
    /// Tasks already queued run to completion; stop markers queue behind
    /// them, one per worker. Handles kept by producers start failing once
    /// the last worker exits and the channel closes.
    pub async fn shutdown(self) {
        for _ in 0..self.workers.len() {
            let _ = self.handle.tx.send(QueueMessage::Stop);
        }
        drop(self.handle);
        for worker in self.workers {
            let _ = worker.await;
        }
        info!("work queue drained");
    }
}

/// Run one task under the hard timeout and apply the retry policy.
async fn execute(
    coordinator: &Coordinator,
    config: &TallyConfig,
    metrics: &TallyMetrics,
    handle: &QueueHandle,
    task: RecomputeTask,
) {
    let run = tokio::time::timeout(config.task_timeout, coordinator.recompute(task.station)).await;

    match run {
        Ok(Ok(RecomputeOutcome::Completed)) => {}
        Ok(Ok(RecomputeOutcome::Contended)) => {
            // Normal contention: try again shortly, same attempt count
            debug!(
                station = %task.station,
                delay_ms = config.contention_requeue_delay.as_millis() as u64,
                "re-enqueueing contended recompute"
            );
            let _ = handle.send_after(task, config.contention_requeue_delay);
        }
        Ok(Err(err)) => {
            retry_or_fail(config, metrics, handle, task, format!("{err}"));
        }
        Err(_) => {
            retry_or_fail(
                config,
                metrics,
                handle,
                task,
                format!("timed out after {:?}", config.task_timeout),
            );
        }
    }
}

fn retry_or_fail(
    config: &TallyConfig,
    metrics: &TallyMetrics,
    handle: &QueueHandle,
    task: RecomputeTask,
    cause: String,
) {
    if let Some(backoff) = config.retry_backoff.get(task.attempt) {
        TallyMetrics::incr(&metrics.tasks_retried);
        warn!(
            station = %task.station,
            attempt = task.attempt + 1,
            backoff_ms = backoff.as_millis() as u64,
            cause = %cause,
            "recompute failed, retrying"
        );
        let _ = handle.send_after(
            RecomputeTask {
                station: task.station,
                attempt: task.attempt + 1,
            },
            *backoff,
        );
    } else {
        TallyMetrics::incr(&metrics.tasks_failed_permanently);
        error!(
            station = %task.station,
            attempts = task.attempt + 1,
            cause = %cause,
            "recompute permanently failed; last committed tally stays authoritative"
        );
    }
}
