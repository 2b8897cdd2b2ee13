// src/core/worker.rs — Task queue, worker pool and poll driver
//
// `create_task` only offers the task to the queue. Everything that moves a
// task forward runs here, off the request path: a dispatcher bounded by a
// semaphore, plus an interval driver that re-enters asynchronous jobs and
// picks up PENDING tasks the queue had no room for.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::MissedTickBehavior;

use crate::core::lifecycle::TaskManager;
use crate::infra::errors::GenTaskError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskMessage {
    /// Claim a PENDING task and call its provider.
    Process(String),
    /// Check on a PROCESSING task waiting for an asynchronous provider.
    Poll(String),
}

impl TaskMessage {
    pub fn task_id(&self) -> &str {
        match self {
            TaskMessage::Process(id) | TaskMessage::Poll(id) => id,
        }
    }
}

#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::Sender<TaskMessage>,
}

impl TaskQueue {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<TaskMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Waits for room in the queue.
    pub async fn enqueue(&self, message: TaskMessage) -> Result<(), GenTaskError> {
        self.tx
            .send(message)
            .await
            .map_err(|_| GenTaskError::Other(anyhow::anyhow!("task queue closed")))
    }

    /// Non-blocking; `false` when the queue is full or closed.
    pub fn try_enqueue(&self, message: TaskMessage) -> bool {
        self.tx.try_send(message).is_ok()
    }
}

/// In-process exclusivity per task id. Across processes the conditional
/// PENDING -> PROCESSING claim plays the same role.
#[derive(Clone, Default)]
pub struct TaskLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl TaskLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_lock(&self, task_id: &str) -> Option<TaskLockGuard> {
        if !lock_set(&self.held).insert(task_id.to_string()) {
            return None;
        }
        Some(TaskLockGuard {
            held: self.held.clone(),
            task_id: task_id.to_string(),
        })
    }

    pub fn is_locked(&self, task_id: &str) -> bool {
        lock_set(&self.held).contains(task_id)
    }
}

fn lock_set(held: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    match held.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Releases the task id on drop.
pub struct TaskLockGuard {
    held: Arc<Mutex<HashSet<String>>>,
    task_id: String,
}

impl Drop for TaskLockGuard {
    fn drop(&mut self) {
        lock_set(&self.held).remove(&self.task_id);
    }
}

/// Consume the queue until shutdown, running at most `concurrency` messages
/// at once. A message for a task that is already being handled is dropped;
/// the poll driver re-sends what still needs attention.
pub async fn run_workers(
    manager: Arc<TaskManager>,
    mut rx: mpsc::Receiver<TaskMessage>,
    concurrency: usize,
    locks: TaskLocks,
    mut shutdown: watch::Receiver<bool>,
) {
    let concurrency = concurrency.max(1);
    let permits = Arc::new(Semaphore::new(concurrency));
    tracing::info!(concurrency, "Worker pool started");

    loop {
        let message = tokio::select! {
            message = rx.recv() => match message {
                Some(m) => m,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let Some(guard) = locks.try_lock(message.task_id()) else {
            tracing::debug!(task_id = message.task_id(), "Task already being handled, message dropped");
            continue;
        };

        let manager = manager.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let _guard = guard;
            let result = match message {
                TaskMessage::Process(ref id) => manager.process_task(id).await,
                TaskMessage::Poll(ref id) => manager.poll_task(id).await,
            };
            if let Err(e) = result {
                tracing::error!(task_id = message.task_id(), error = %e, "Task handling failed");
            }
        });
    }

    // Let in-flight handlers finish before reporting the pool stopped
    let _ = permits.acquire_many(concurrency as u32).await;
    tracing::info!("Worker pool stopped");
}

/// Enqueue a `Poll` for every task waiting on an asynchronous provider,
/// then requeue PENDING tasks that missed the queue. Stops early when the
/// queue is full; the next tick picks up the rest.
pub async fn poll_tick(manager: &TaskManager, batch: u32) -> Result<usize, GenTaskError> {
    let waiting = manager.awaiting_poll(batch).await?;
    let mut queued = 0;
    for task in waiting {
        if !manager.queue().try_enqueue(TaskMessage::Poll(task.id)) {
            tracing::debug!(queued, "Task queue full, deferring remaining polls");
            return Ok(queued);
        }
        queued += 1;
    }
    queued += manager.requeue_idle_pending(batch).await?;
    Ok(queued)
}

pub async fn run_poll_driver(
    manager: Arc<TaskManager>,
    interval: Duration,
    batch: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match poll_tick(&manager, batch).await {
                    Ok(0) => {}
                    Ok(n) => tracing::debug!(queued = n, "Poll tick"),
                    Err(e) => tracing::warn!(error = %e, "Poll tick failed"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    tracing::info!("Poll driver stopped");
}
