use crate::queue::store::{FjallQueue, QueueError, VerifyTask};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

/// TaskEnvelope wraps a VerifyTask with its sequence number
#[derive(Clone, Debug)]
pub struct TaskEnvelope {
    pub seq: u64,
    pub task: VerifyTask,
}

impl TaskEnvelope {
    /// Correlation id recorded on the job when it starts.
    ///
    /// Stable across replays of the same queue entry, so a redelivered task
    /// is recognized by the job's idempotent start.
    pub fn correlation_id(&self) -> String {
        correlation_id(self.seq)
    }
}

pub fn correlation_id(seq: u64) -> String {
    format!("task-{:016}", seq)
}

/// TaskBroker distributes verification tasks to the worker pool
///
/// Architecture:
/// 1. Submission calls `broker.enqueue(task)`
/// 2. Broker persists task to FjallQueue (atomic, get seq)
/// 3. Broker sends TaskEnvelope{seq, task} to a worker via mpsc channel
/// 4. Round-robin distribution across worker pool
/// 5. Backpressure via bounded channels
///
/// Workers `ack` a task once its job is terminal or skipped; `replay` re-sends
/// every unacknowledged task after a restart.
pub struct TaskBroker {
    queue: Arc<RwLock<FjallQueue>>,
    worker_channels: Vec<mpsc::Sender<TaskEnvelope>>,
    next_worker: AtomicUsize,
}

impl TaskBroker {
    /// Create a new TaskBroker with worker channels
    ///
    /// Returns:
    /// - TaskBroker instance (shared via Arc)
    /// - Vec of receivers (one per worker, for spawning workers)
    pub fn new(
        queue: Arc<RwLock<FjallQueue>>,
        num_workers: usize,
        channel_size: usize,
    ) -> (Self, Vec<mpsc::Receiver<TaskEnvelope>>) {
        info!(
            num_workers,
            channel_size, "Creating TaskBroker with worker channels"
        );

        let mut worker_channels = Vec::with_capacity(num_workers);
        let mut worker_receivers = Vec::with_capacity(num_workers);

        for worker_id in 0..num_workers {
            let (tx, rx) = mpsc::channel(channel_size);
            worker_channels.push(tx);
            worker_receivers.push(rx);
            debug!(worker_id, "Created worker channel");
        }

        let broker = Self {
            queue,
            worker_channels,
            next_worker: AtomicUsize::new(0),
        };

        (broker, worker_receivers)
    }

    /// Persist a task and hand it to the next worker.
    ///
    /// Returns the task's correlation id.
    pub async fn enqueue(&self, task: VerifyTask) -> Result<String, QueueError> {
        let seq = {
            let queue = self.queue.write().await;
            queue.enqueue(&task)?
        };

        debug!(
            seq,
            job_id = %task.job_id,
            batch_id = %task.batch_id,
            "Task persisted to queue"
        );

        let envelope = TaskEnvelope { seq, task };
        let correlation = envelope.correlation_id();
        self.distribute(envelope).await;
        Ok(correlation)
    }

    async fn distribute(&self, envelope: TaskEnvelope) {
        if self.worker_channels.is_empty() {
            warn!(seq = envelope.seq, "No workers attached, task stays queued");
            return;
        }

        let seq = envelope.seq;
        let worker_idx =
            self.next_worker.fetch_add(1, Ordering::Relaxed) % self.worker_channels.len();

        // Bounded channel: a full worker applies backpressure here
        match self.worker_channels[worker_idx].send(envelope).await {
            Ok(_) => debug!(seq, worker_idx, "Task sent to worker"),
            Err(_) => {
                // Still persisted, so the next replay delivers it
                warn!(seq, worker_idx, "Worker channel closed, task not delivered");
            }
        }
    }

    /// Re-send every unacknowledged task. Returns how many were replayed.
    pub async fn replay(&self) -> Result<usize, QueueError> {
        let pending = {
            let queue = self.queue.read().await;
            queue.pending()?
        };

        let count = pending.len();
        for (seq, task) in pending {
            self.distribute(TaskEnvelope { seq, task }).await;
        }

        if count > 0 {
            info!(count, "Replayed unacknowledged tasks");
        }
        Ok(count)
    }

    /// Acknowledge a finished task
    pub async fn ack(&self, seq: u64) -> Result<(), QueueError> {
        self.queue.read().await.ack(seq)
    }

    /// Park a task whose job failed for good
    pub async fn dead_letter(
        &self,
        seq: u64,
        failure_code: &str,
        failure_message: &str,
        attempts: u32,
    ) -> Result<(), QueueError> {
        self.queue.write().await.move_to_dlq(
            seq,
            failure_code.to_string(),
            failure_message.to_string(),
            attempts,
        )
    }

    /// Check if all worker channels are healthy (not closed)
    pub fn health_check(&self) -> bool {
        self.worker_channels.iter().all(|ch| !ch.is_closed())
    }
}
