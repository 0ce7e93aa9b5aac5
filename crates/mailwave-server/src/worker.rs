//! Background send worker.
//!
//! A single long-lived task owns the receiving end of a bounded job channel.
//! Each job starts a delivery pass for one queue in its own task; the worker
//! keeps those passes in a `JoinSet` so panics are logged instead of lost.
//! A semaphore caps how many passes deliver at once. Handing a job over never
//! waits for the pass.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use mailwave_shared::QueueId;

use crate::delivery::Delivery;
use crate::error::ServerError;

/// Request to run a delivery pass over one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerJob {
    pub queue_id: QueueId,
}

/// Sending side of the worker channel. Cheap to clone.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<WorkerJob>,
}

impl WorkerHandle {
    /// Queue a pass without waiting for it.
    pub fn submit(&self, queue_id: QueueId) -> Result<(), ServerError> {
        self.tx
            .try_send(WorkerJob { queue_id })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    ServerError::Internal("worker queue is full".into())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    ServerError::Internal("worker is not running".into())
                }
            })
    }
}

/// Sizing of the worker.
#[derive(Debug, Clone, Copy)]
pub struct WorkerLimits {
    /// Records in flight within one pass.
    pub per_queue: usize,
    /// Passes delivering at the same time.
    pub queues: usize,
    /// Jobs buffered in the channel.
    pub capacity: usize,
}

/// Spawn the worker task. It runs until every [`WorkerHandle`] is dropped
/// and all passes in flight have finished.
pub fn spawn_worker(delivery: Delivery, limits: WorkerLimits) -> (WorkerHandle, JoinHandle<()>) {
    let (handle, rx) = channel(limits.capacity);
    let task = tokio::spawn(run(delivery, rx, limits));
    (handle, task)
}

pub(crate) fn channel(capacity: usize) -> (WorkerHandle, mpsc::Receiver<WorkerJob>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (WorkerHandle { tx }, rx)
}

async fn run(delivery: Delivery, mut rx: mpsc::Receiver<WorkerJob>, limits: WorkerLimits) {
    let concurrency = limits.per_queue.max(1);
    let slots = Arc::new(Semaphore::new(limits.queues.max(1)));
    info!(concurrency, queues = limits.queues, "Send worker started");
    let mut passes: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            job = rx.recv() => {
                let Some(WorkerJob { queue_id }) = job else {
                    break;
                };
                debug!(queue_id = %queue_id, "Worker picked up queue");
                let delivery = delivery.clone();
                let slots = slots.clone();
                passes.spawn(async move {
                    let Ok(_slot) = slots.acquire_owned().await else {
                        return;
                    };
                    match delivery.run_pass(queue_id, concurrency).await {
                        Ok(queue) => debug!(
                            queue_id = %queue_id,
                            status = %queue.status,
                            "Worker pass done"
                        ),
                        Err(e) => error!(queue_id = %queue_id, error = %e, "Worker pass failed"),
                    }
                });
            }
            Some(joined) = passes.join_next(), if !passes.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "Worker pass panicked");
                }
            }
        }
    }

    while let Some(joined) = passes.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Worker pass panicked");
        }
    }
    info!("Send worker stopped");
}

/// Re-submit every queue that has not reached a terminal state, so work
/// interrupted by a restart carries on. Returns how many were submitted.
pub fn resume_unfinished(delivery: &Delivery, worker: &WorkerHandle) -> Result<usize, ServerError> {
    let queues = delivery.db().with(|db| db.list_unfinished_queues())?;
    let mut submitted = 0;
    for queue in queues {
        match worker.submit(queue.id) {
            Ok(()) => submitted += 1,
            Err(e) => warn!(queue_id = %queue.id, error = %e, "Could not resume queue"),
        }
    }
    if submitted > 0 {
        info!(submitted, "Resumed unfinished send queues");
    }
    Ok(submitted)
}
