//! Bounded-concurrency dispatch of verification jobs
//!
//! Jobs reach workers through the durable [`TaskBroker`]; each worker runs
//! one external interaction at a time, all workers share one jitter gate
//! ([`Throttle`]) and every job follows the same [`RetryPolicy`]. Completion
//! is pushed to subscribers as [`JobOutcome`]s.

pub mod retry;
pub mod throttle;
mod worker;

pub use retry::RetryPolicy;
pub use throttle::Throttle;

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::info;

use crate::batch::{Batch, Job, JobStatus};
use crate::config::DispatcherConfig;
use crate::ledger::{FjallStore, LedgerError};
use crate::observability::Metrics;
use crate::packager::Packager;
use crate::queue::store::now_ms;
use crate::queue::{QueueError, TaskBroker, TaskEnvelope, VerifyTask};
use crate::storage::StorageClient;
use crate::verifier::VerifierProtocol;
use worker::WorkerContext;

const OUTCOME_CHANNEL_SIZE: usize = 1024;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

/// Terminal result of one job, pushed to subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub batch_id: String,
    pub job_id: String,
    pub status: JobStatus,
    pub is_valid: Option<bool>,
    pub proof_missing: bool,
    pub attempts: u32,
    pub error: Option<String>,
    /// This job was the one that completed its batch
    pub batch_completed: bool,
}

pub struct Dispatcher {
    ctx: Arc<WorkerContext>,
}

impl Dispatcher {
    pub fn new(
        config: &DispatcherConfig,
        store: Arc<FjallStore>,
        broker: Arc<TaskBroker>,
        protocol: Arc<VerifierProtocol>,
        storage: StorageClient,
        packager: Option<Arc<Packager>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_SIZE);
        let ctx = WorkerContext {
            store,
            broker,
            protocol,
            storage,
            packager,
            metrics,
            throttle: Throttle::new(config.jitter_min.as_duration(), config.jitter_max.as_duration()),
            policy: RetryPolicy::from_config(config),
            job_timeout: config.job_timeout.as_duration(),
            retry_missing_proof: config.retry_missing_proof,
            auto_pack: config.auto_pack,
            outcomes,
        };
        Self { ctx: Arc::new(ctx) }
    }

    /// Spawn one worker per broker receiver
    pub fn start(&self, receivers: Vec<mpsc::Receiver<TaskEnvelope>>) -> Vec<JoinHandle<()>> {
        info!(
            workers = receivers.len(),
            target = self.ctx.protocol.target_name(),
            "Starting dispatcher"
        );
        receivers
            .into_iter()
            .enumerate()
            .map(|(worker_id, receiver)| {
                tokio::spawn(worker::run(worker_id, self.ctx.clone(), receiver))
            })
            .collect()
    }

    /// Completion stream. Only outcomes sent after subscribing are seen.
    pub fn subscribe(&self) -> broadcast::Receiver<JobOutcome> {
        self.ctx.outcomes.subscribe()
    }

    /// Enqueue every still-pending job of a batch. Returns the correlation ids.
    pub async fn submit(&self, batch: &Batch, jobs: &[Job]) -> Result<Vec<String>> {
        let mut correlations = Vec::with_capacity(jobs.len());

        for job in jobs.iter().filter(|job| job.status == JobStatus::Pending) {
            let task = VerifyTask {
                job_id: job.id.clone(),
                batch_id: batch.id.clone(),
                owner_id: batch.owner_id.clone(),
                country_code: job.country_code.clone(),
                vat_number: job.vat_number.clone(),
                enqueued_at_ms: now_ms(),
            };
            correlations.push(self.ctx.broker.enqueue(task).await?);
        }

        self.ctx.metrics.jobs_dispatched(correlations.len() as u64);
        info!(batch_id = %batch.id, jobs = correlations.len(), "Batch submitted for verification");
        Ok(correlations)
    }

    /// Stop scheduling the batch's pending jobs. In-flight jobs finish.
    pub fn cancel(&self, batch_id: &str) -> Result<Batch> {
        let batch = self.ctx.store.update_batch(batch_id, |batch| {
            if !batch.is_completed() {
                batch.cancel_requested = true;
            }
        })?;
        info!(batch_id, "Batch cancellation requested");
        Ok(batch)
    }

    /// Redeliver tasks left unacknowledged by a previous run
    pub async fn resume(&self) -> Result<usize> {
        Ok(self.ctx.broker.replay().await?)
    }

    /// Whether every worker channel is still open
    pub fn is_healthy(&self) -> bool {
        self.ctx.broker.health_check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PackagerConfig, VerifierConfig};
    use crate::humanize::HumanDuration;
    use crate::queue::FjallQueue;
    use crate::verifier::scripted::{Script, ScriptedTarget};
    use crate::verifier::{Markers, ProtocolTimings};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::RwLock;

    struct Harness {
        _dir: TempDir,
        store: Arc<FjallStore>,
        queue: Arc<RwLock<FjallQueue>>,
        storage: StorageClient,
        target: Arc<ScriptedTarget>,
        dispatcher: Dispatcher,
        _workers: Vec<JoinHandle<()>>,
    }

    fn config() -> DispatcherConfig {
        DispatcherConfig {
            pool_size: 2,
            jitter_min: HumanDuration::from_millis(0),
            jitter_max: HumanDuration::from_millis(0),
            backoff_base: HumanDuration::from_secs(1),
            backoff_max: HumanDuration::from_secs(4),
            ..DispatcherConfig::default()
        }
    }

    fn harness(config: DispatcherConfig) -> Harness {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FjallStore::open(dir.path().join("ledger")).unwrap());
        let queue = Arc::new(RwLock::new(
            FjallQueue::open(dir.path().join("queue")).unwrap(),
        ));
        let (broker, receivers) =
            TaskBroker::new(queue.clone(), config.pool_size, config.channel_size);
        let storage = StorageClient::in_memory();
        let target = Arc::new(ScriptedTarget::new());
        let protocol = Arc::new(VerifierProtocol::with_timings(
            target.clone(),
            Markers::from_config(&VerifierConfig::default()),
            ProtocolTimings {
                result_timeout: Duration::from_secs(2),
                proof_timeout: Duration::from_secs(2),
                poll_interval: Duration::from_millis(500),
            },
        ));
        let packager = Arc::new(Packager::new(
            store.clone(),
            storage.clone(),
            PackagerConfig::default(),
        ));

        let dispatcher = Dispatcher::new(
            &config,
            store.clone(),
            Arc::new(broker),
            protocol,
            storage.clone(),
            Some(packager),
            Arc::new(Metrics::new()),
        );
        let workers = dispatcher.start(receivers);

        Harness {
            _dir: dir,
            store,
            queue,
            storage,
            target,
            dispatcher,
            _workers: workers,
        }
    }

    fn seed(h: &Harness, numbers: &[&str]) -> (Batch, Vec<Job>) {
        let batch = Batch::new("owner-1", "manual", numbers.len());
        let jobs: Vec<Job> = numbers
            .iter()
            .enumerate()
            .map(|(idx, number)| {
                Job::builder()
                    .owner_id("owner-1")
                    .batch_id(batch.id.clone())
                    .country_code("FR")
                    .vat_number(*number)
                    .original_input(format!("FR{}", number))
                    .line_number(idx + 1)
                    .build()
            })
            .collect();
        h.store.create_batch(&batch, &jobs, None).unwrap();
        (batch, jobs)
    }

    async fn collect(
        receiver: &mut broadcast::Receiver<JobOutcome>,
        count: usize,
    ) -> Vec<JobOutcome> {
        let mut outcomes = Vec::new();
        while outcomes.len() < count {
            outcomes.push(receiver.recv().await.unwrap());
        }
        outcomes
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_indeterminate_then_succeeds() {
        let h = harness(config());
        h.target.push(Script::page("<html>busy</html>"));
        h.target.push(Script::page("<html>busy</html>"));
        h.target
            .push(Script::valid("ACME SA").with_proof(b"%PDF-1.4".to_vec()));

        let (batch, jobs) = seed(&h, &["12345678901"]);
        let mut outcomes = h.dispatcher.subscribe();
        h.dispatcher.submit(&batch, &jobs).await.unwrap();

        let outcome = collect(&mut outcomes, 1).await.remove(0);
        assert_eq!(outcome.status, JobStatus::Completed);
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.batch_completed);

        let job = h.store.get_job(&jobs[0].id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.is_valid, Some(true));
        assert_eq!(job.retry_count, 2);
        assert_eq!(job.verified_name.as_deref(), Some("ACME SA"));

        let batch = h.store.get_batch(&batch.id).unwrap().unwrap();
        assert!(batch.is_completed());
        assert_eq!(batch.valid_jobs, 1);
        // Auto-packed; the proof was archived and removed
        let archive = batch.archive.unwrap();
        assert!(h.storage.exists(&archive.path).await.unwrap());
        assert!(h.queue.read().await.pending().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_fail_and_dead_letter() {
        let h = harness(config());
        h.target.set_fallback(Script::unavailable());

        let (batch, jobs) = seed(&h, &["12345678901"]);
        let mut outcomes = h.dispatcher.subscribe();
        h.dispatcher.submit(&batch, &jobs).await.unwrap();

        let outcome = collect(&mut outcomes, 1).await.remove(0);
        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.attempts, 4);

        let job = h.store.get_job(&jobs[0].id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 3);
        assert!(job.error.unwrap().contains("unavailable"));
        assert_eq!(h.target.opened_sessions(), 4);

        let dlq = h.queue.read().await.list_dlq(10).unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].1.failure_code, "UNAVAILABLE");

        // Failed jobs still complete the batch
        let batch = h.store.get_batch(&batch.id).unwrap().unwrap();
        assert!(batch.is_completed());
        assert_eq!(batch.failed_jobs, 1);
        assert!(batch.archive.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_job_timeout_cuts_retries_short() {
        let h = harness(DispatcherConfig {
            max_retries: 10,
            job_timeout: HumanDuration::from_secs(3),
            ..config()
        });
        h.target.set_fallback(Script::unavailable());

        let (batch, jobs) = seed(&h, &["12345678901"]);
        let mut outcomes = h.dispatcher.subscribe();
        h.dispatcher.submit(&batch, &jobs).await.unwrap();

        // 1s backoff fits the budget, the following 2s one does not
        let outcome = collect(&mut outcomes, 1).await.remove(0);
        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(h.target.opened_sessions(), 2);

        let job = h.store.get_job(&jobs[0].id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 1);
        let dlq = h.queue.read().await.list_dlq(10).unwrap();
        assert_eq!(dlq[0].1.failure_code, "UNAVAILABLE");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_input_is_not_retried() {
        let h = harness(config());
        h.target.push(Script::page("INVALID_INPUT"));

        let (batch, jobs) = seed(&h, &["12345678901"]);
        let mut outcomes = h.dispatcher.subscribe();
        h.dispatcher.submit(&batch, &jobs).await.unwrap();

        let outcome = collect(&mut outcomes, 1).await.remove(0);
        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(h.target.opened_sessions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_proof_accepted_after_retries() {
        let h = harness(DispatcherConfig {
            max_retries: 1,
            ..config()
        });
        h.target.set_fallback(Script::valid("ACME SA"));

        let (batch, jobs) = seed(&h, &["12345678901"]);
        let mut outcomes = h.dispatcher.subscribe();
        h.dispatcher.submit(&batch, &jobs).await.unwrap();

        let outcome = collect(&mut outcomes, 1).await.remove(0);
        assert_eq!(outcome.status, JobStatus::Completed);
        assert!(outcome.proof_missing);
        assert_eq!(outcome.attempts, 2);

        let job = h.store.get_job(&jobs[0].id).unwrap().unwrap();
        assert_eq!(job.is_valid, Some(true));
        assert!(job.proof_missing);
        assert!(job.proof_path.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_proof_accepted_immediately_when_configured() {
        let h = harness(DispatcherConfig {
            retry_missing_proof: false,
            ..config()
        });
        h.target.set_fallback(Script::valid("ACME SA"));

        let (batch, jobs) = seed(&h, &["12345678901"]);
        let mut outcomes = h.dispatcher.subscribe();
        h.dispatcher.submit(&batch, &jobs).await.unwrap();

        let outcome = collect(&mut outcomes, 1).await.remove(0);
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.proof_missing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_pending_jobs() {
        let h = harness(config());
        h.target.set_fallback(Script::invalid());

        let (batch, jobs) = seed(&h, &["11111111111", "22222222222", "33333333333"]);
        h.dispatcher.cancel(&batch.id).unwrap();
        h.dispatcher.submit(&batch, &jobs).await.unwrap();

        // Let the workers drain their channels
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(h.target.opened_sessions(), 0);
        for job in &jobs {
            let job = h.store.get_job(&job.id).unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Pending);
        }
        let batch = h.store.get_batch(&batch.id).unwrap().unwrap();
        assert!(batch.cancel_requested);
        assert!(!batch.is_completed());
        assert!(h.queue.read().await.pending().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_counters_stay_consistent_across_workers() {
        let h = harness(config());
        h.target.push_for("11111111111", Script::invalid());
        h.target.push_for("22222222222", Script::page("INVALID_INPUT"));
        h.target.push_for(
            "33333333333",
            Script::valid("Gamma").with_proof(b"%PDF".to_vec()),
        );

        let (batch, jobs) = seed(&h, &["11111111111", "22222222222", "33333333333"]);
        let mut outcomes = h.dispatcher.subscribe();
        h.dispatcher.submit(&batch, &jobs).await.unwrap();

        let outcomes = collect(&mut outcomes, 3).await;
        assert_eq!(outcomes.iter().filter(|o| o.batch_completed).count(), 1);

        let batch = h.store.get_batch(&batch.id).unwrap().unwrap();
        assert_eq!(batch.completed_jobs, 3);
        assert_eq!(
            batch.completed_jobs,
            batch.successful_jobs + batch.failed_jobs
        );
        assert_eq!(batch.successful_jobs, 2);
        assert_eq!(batch.valid_jobs, 1);
        assert_eq!(batch.percentage(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_after_completion_is_noop() {
        let h = harness(config());
        h.target.set_fallback(Script::invalid());

        let (batch, jobs) = seed(&h, &["12345678901"]);
        let mut outcomes = h.dispatcher.subscribe();
        h.dispatcher.submit(&batch, &jobs).await.unwrap();
        collect(&mut outcomes, 1).await;

        // Replaying after completion finds nothing left to do
        assert_eq!(h.dispatcher.resume().await.unwrap(), 0);
        assert_eq!(h.target.opened_sessions(), 1);
    }
}
