use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    #[error("Task encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Task not found: seq={0}")]
    TaskNotFound(u64),

    #[error("Invalid sequence number")]
    InvalidSequence,
}

pub type Result<T> = std::result::Result<T, QueueError>;

const NEXT_SEQ_KEY: &[u8] = b"next_seq";

/// One unit of work for the dispatcher: verify a single job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyTask {
    pub job_id: String,
    pub batch_id: String,
    pub owner_id: String,
    pub country_code: String,
    pub vat_number: String,
    pub enqueued_at_ms: u64,
}

/// A task that exhausted its attempts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterTask {
    pub task: VerifyTask,
    pub failure_code: String,
    pub failure_message: String,
    pub attempts: u32,
    pub failed_at_ms: u64,
}

/// FjallQueue manages task persistence and DLQ using Fjall embedded database
///
/// Architecture:
/// - `tasks` partition: u64 (big-endian) → VerifyTask (JSON), removed on ack
/// - `metadata` partition: "next_seq" → u64 (atomic counter)
/// - `dlq` partition: u64 (big-endian) → DeadLetterTask (JSON)
///
/// Whatever is still in `tasks` at startup was never acknowledged and is
/// replayed, which gives at-least-once delivery keyed by job id.
pub struct FjallQueue {
    keyspace: Keyspace,
    tasks: PartitionHandle,
    metadata: PartitionHandle,
    dlq: PartitionHandle,
    seq_counter: Arc<AtomicU64>,
}

fn decode_seq(key: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = key.try_into().map_err(|_| QueueError::InvalidSequence)?;
    Ok(u64::from_be_bytes(bytes))
}

impl FjallQueue {
    /// Open or create a new FjallQueue at the specified path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!("Opening FjallQueue at: {}", path.as_ref().display());

        let keyspace = Config::new(path).open()?;

        let tasks = keyspace.open_partition("tasks", PartitionCreateOptions::default())?;
        let metadata = keyspace.open_partition("metadata", PartitionCreateOptions::default())?;
        let dlq = keyspace.open_partition("dlq", PartitionCreateOptions::default())?;

        let current_seq = match metadata.get(NEXT_SEQ_KEY)? {
            Some(bytes) => decode_seq(&bytes)?,
            None => 0,
        };

        info!("FjallQueue opened, current sequence: {}", current_seq);

        Ok(Self {
            keyspace,
            tasks,
            metadata,
            dlq,
            seq_counter: Arc::new(AtomicU64::new(current_seq)),
        })
    }

    /// Persist a task and return its sequence number
    ///
    /// The task and the advanced counter are written in one batch.
    pub fn enqueue(&self, task: &VerifyTask) -> Result<u64> {
        let seq = self.seq_counter.fetch_add(1, Ordering::SeqCst);
        let value = serde_json::to_vec(task)?;

        let mut write = self.keyspace.batch();
        write.insert(&self.tasks, seq.to_be_bytes().to_vec(), value);
        write.insert(&self.metadata, NEXT_SEQ_KEY, (seq + 1).to_be_bytes().to_vec());
        write.commit()?;

        debug!(seq, job_id = %task.job_id, "Task enqueued");

        Ok(seq)
    }

    /// Retrieve a task by sequence number
    pub fn get_task(&self, seq: u64) -> Result<Option<VerifyTask>> {
        match self.tasks.get(seq.to_be_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Remove a task once its job reached a terminal state (or was skipped)
    pub fn ack(&self, seq: u64) -> Result<()> {
        self.tasks.remove(seq.to_be_bytes().to_vec())?;
        debug!(seq, "Task acknowledged");
        Ok(())
    }

    /// Unacknowledged tasks in sequence order
    pub fn pending(&self) -> Result<Vec<(u64, VerifyTask)>> {
        let mut results = Vec::new();
        for item in self.tasks.iter() {
            let (key, value) = item?;
            results.push((decode_seq(&key)?, serde_json::from_slice(&value)?));
        }
        Ok(results)
    }

    /// Move a task to the Dead Letter Queue (DLQ)
    ///
    /// Called when a job exhausts its retries or fails definitively.
    pub fn move_to_dlq(
        &self,
        seq: u64,
        failure_code: String,
        failure_message: String,
        attempts: u32,
    ) -> Result<()> {
        let task = self.get_task(seq)?.ok_or(QueueError::TaskNotFound(seq))?;

        let dlq_entry = DeadLetterTask {
            task,
            failure_code,
            failure_message,
            attempts,
            failed_at_ms: now_ms(),
        };

        let mut write = self.keyspace.batch();
        write.insert(&self.dlq, seq.to_be_bytes().to_vec(), serde_json::to_vec(&dlq_entry)?);
        write.remove(&self.tasks, seq.to_be_bytes().to_vec());
        write.commit()?;

        info!(seq, attempts, "Task moved to DLQ");

        Ok(())
    }

    /// List DLQ tasks (for debugging/inspection)
    pub fn list_dlq(&self, limit: usize) -> Result<Vec<(u64, DeadLetterTask)>> {
        let mut results = Vec::new();

        for item in self.dlq.iter().take(limit) {
            let (key, value) = item?;
            results.push((decode_seq(&key)?, serde_json::from_slice(&value)?));
        }

        Ok(results)
    }

    /// Flush all writes to disk
    pub fn flush(&self) -> Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }

    /// Health check - verify database is accessible
    pub fn health_check(&self) -> Result<()> {
        let _ = self.metadata.get(NEXT_SEQ_KEY)?;
        Ok(())
    }
}

/// Get current Unix timestamp in milliseconds
pub(crate) fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_task(job_id: &str) -> VerifyTask {
        VerifyTask {
            job_id: job_id.to_string(),
            batch_id: "batch-1".to_string(),
            owner_id: "owner-1".to_string(),
            country_code: "FR".to_string(),
            vat_number: "12345678901".to_string(),
            enqueued_at_ms: now_ms(),
        }
    }

    #[test]
    fn test_enqueue_and_retrieve() {
        let temp_dir = TempDir::new().unwrap();
        let queue = FjallQueue::open(temp_dir.path()).unwrap();

        let seq = queue.enqueue(&create_test_task("job1")).unwrap();
        assert_eq!(seq, 0);

        let retrieved = queue.get_task(seq).unwrap().unwrap();
        assert_eq!(retrieved.job_id, "job1");
    }

    #[test]
    fn test_sequential_ids() {
        let temp_dir = TempDir::new().unwrap();
        let queue = FjallQueue::open(temp_dir.path()).unwrap();

        let seq1 = queue.enqueue(&create_test_task("job1")).unwrap();
        let seq2 = queue.enqueue(&create_test_task("job2")).unwrap();
        let seq3 = queue.enqueue(&create_test_task("job3")).unwrap();

        assert_eq!((seq1, seq2, seq3), (0, 1, 2));
    }

    #[test]
    fn test_ack_removes_from_pending() {
        let temp_dir = TempDir::new().unwrap();
        let queue = FjallQueue::open(temp_dir.path()).unwrap();

        let first = queue.enqueue(&create_test_task("job1")).unwrap();
        queue.enqueue(&create_test_task("job2")).unwrap();
        queue.ack(first).unwrap();

        let pending = queue.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].1.job_id, "job2");
        assert!(queue.get_task(first).unwrap().is_none());
    }

    #[test]
    fn test_move_to_dlq() {
        let temp_dir = TempDir::new().unwrap();
        let queue = FjallQueue::open(temp_dir.path()).unwrap();

        let seq = queue.enqueue(&create_test_task("failed_job")).unwrap();
        queue
            .move_to_dlq(seq, "TIMEOUT".to_string(), "no result marker".to_string(), 4)
            .unwrap();

        let dlq = queue.list_dlq(10).unwrap();
        assert_eq!(dlq.len(), 1);
        let (dlq_seq, dlq_task) = &dlq[0];
        assert_eq!(*dlq_seq, seq);
        assert_eq!(dlq_task.failure_code, "TIMEOUT");
        assert_eq!(dlq_task.attempts, 4);
        assert_eq!(dlq_task.task.job_id, "failed_job");
        assert!(queue.pending().unwrap().is_empty());

        assert!(matches!(
            queue.move_to_dlq(99, "X".into(), "Y".into(), 1),
            Err(QueueError::TaskNotFound(99))
        ));
    }

    #[test]
    fn test_persistence_across_reopens() {
        let temp_dir = TempDir::new().unwrap();

        let seq = {
            let queue = FjallQueue::open(temp_dir.path()).unwrap();
            let seq = queue.enqueue(&create_test_task("job1")).unwrap();
            queue.flush().unwrap();
            seq
        };

        let queue = FjallQueue::open(temp_dir.path()).unwrap();
        let seq2 = queue.enqueue(&create_test_task("job2")).unwrap();
        assert_eq!(seq2, 1);

        // Never acked, so it is replayed
        let pending = queue.pending().unwrap();
        assert_eq!(pending[0].0, seq);
        assert_eq!(pending.len(), 2);
    }
}
