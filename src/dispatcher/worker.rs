//! Per-task processing: start the job, run attempts, record the verdict

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::retry::RetryPolicy;
use super::throttle::Throttle;
use super::{DispatchError, JobOutcome, Result};
use crate::batch::{Applied, JobEvent, JobStatus, TransitionError, Verdict, recompute};
use crate::ledger::{FjallStore, LedgerError};
use crate::observability::Metrics;
use crate::packager::{PackageError, Packager, proof_key};
use crate::queue::{TaskBroker, TaskEnvelope};
use crate::storage::StorageClient;
use crate::verifier::{ProofCapture, ProtocolError, VerificationOutcome, VerifierProtocol};

/// Everything a worker needs, shared by the whole pool
pub(crate) struct WorkerContext {
    pub store: Arc<FjallStore>,
    pub broker: Arc<TaskBroker>,
    pub protocol: Arc<VerifierProtocol>,
    pub storage: StorageClient,
    pub packager: Option<Arc<Packager>>,
    pub metrics: Arc<Metrics>,
    pub throttle: Throttle,
    pub policy: RetryPolicy,
    pub job_timeout: Duration,
    pub retry_missing_proof: bool,
    pub auto_pack: bool,
    pub outcomes: broadcast::Sender<JobOutcome>,
}

/// How the attempt loop ended
enum Settled {
    Verified(VerificationOutcome),
    Failed {
        error: ProtocolError,
        raw_trace: String,
    },
}

pub(crate) async fn run(
    worker_id: usize,
    ctx: Arc<WorkerContext>,
    mut receiver: mpsc::Receiver<TaskEnvelope>,
) {
    info!(worker_id, "Worker started");

    while let Some(envelope) = receiver.recv().await {
        let seq = envelope.seq;
        let job_id = envelope.task.job_id.clone();
        if let Err(e) = process(&ctx, envelope).await {
            // Left unacknowledged, so the task is replayed on restart
            error!(worker_id, seq, job_id = %job_id, error = %e, "Task processing failed");
        }
    }

    info!(worker_id, "Worker stopped");
}

async fn process(ctx: &WorkerContext, envelope: TaskEnvelope) -> Result<()> {
    let task = &envelope.task;
    let seq = envelope.seq;

    let Some(job) = ctx.store.get_job(&task.job_id)? else {
        warn!(seq, job_id = %task.job_id, "Job vanished, dropping task");
        ctx.broker.ack(seq).await?;
        return Ok(());
    };
    if job.is_terminal() {
        debug!(seq, job_id = %job.id, "Job already terminal, dropping task");
        ctx.broker.ack(seq).await?;
        return Ok(());
    }

    let Some(batch) = ctx.store.get_batch(&task.batch_id)? else {
        warn!(seq, batch_id = %task.batch_id, "Batch vanished, dropping task");
        ctx.broker.ack(seq).await?;
        return Ok(());
    };
    if batch.cancel_requested && job.status == JobStatus::Pending {
        info!(batch_id = %batch.id, job_id = %job.id, "Batch canceled, job not scheduled");
        ctx.broker.ack(seq).await?;
        return Ok(());
    }

    let started = ctx.store.update_job(&job.id, |job| {
        job.transition(
            JobEvent::Start {
                task_id: envelope.correlation_id(),
            },
            Utc::now(),
        )
    });
    match started {
        Ok((_, Applied::Changed)) => {
            debug!(batch_id = %batch.id, job_id = %job.id, "Job started");
        }
        Ok((_, Applied::Unchanged)) => {
            info!(batch_id = %batch.id, job_id = %job.id, "Resuming redelivered job");
        }
        Err(LedgerError::Transition(e @ TransitionError::TaskMismatch { .. }))
        | Err(LedgerError::Transition(e @ TransitionError::Terminal { .. })) => {
            warn!(seq, job_id = %job.id, error = %e, "Job owned elsewhere, dropping task");
            ctx.broker.ack(seq).await?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }

    ctx.store.update_batch(&batch.id, |batch| {
        if batch.mark_processing(Utc::now()) {
            info!(batch_id = %batch.id, "Batch processing");
        }
    })?;

    let (settled, attempts) =
        attempt_until_settled(ctx, &job.country_code, &job.vat_number, &job.id).await;

    let outcome = match settled {
        Settled::Verified(outcome) => {
            let verdict = record_verdict(ctx, &batch.id, &job.id, outcome).await;
            let is_valid = verdict.is_valid;
            let proof_missing = verdict.proof_missing;

            let proof_path = verdict.proof_path.clone();
            let recorded = ctx.store.update_job(&job.id, |job| {
                job.transition(JobEvent::Succeed { verdict, attempts }, Utc::now())
            });
            match recorded {
                Ok(_) => {}
                Err(LedgerError::JobNotFound(_)) => {
                    warn!(batch_id = %batch.id, job_id = %job.id, "Job deleted mid-verification, discarding verdict");
                    if let Some(path) = proof_path {
                        if let Err(e) = ctx.storage.delete(&path).await {
                            warn!(job_id = %job.id, error = %e, "Failed to remove orphaned proof");
                        }
                    }
                    ctx.broker.ack(seq).await?;
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
            ctx.broker.ack(seq).await?;

            ctx.metrics.job_completed();
            if proof_missing {
                ctx.metrics.proof_missing();
            }
            info!(
                batch_id = %batch.id,
                job_id = %job.id,
                is_valid,
                attempts,
                proof_missing,
                "Job completed"
            );

            JobOutcome {
                batch_id: batch.id.clone(),
                job_id: job.id.clone(),
                status: JobStatus::Completed,
                is_valid: Some(is_valid),
                proof_missing,
                attempts,
                error: None,
                batch_completed: false,
            }
        }
        Settled::Failed { error, raw_trace } => {
            let message = error.to_string();
            let recorded = ctx.store.update_job(&job.id, |job| {
                job.transition(
                    JobEvent::Fail {
                        error: message.clone(),
                        raw_trace: Some(raw_trace),
                        attempts,
                    },
                    Utc::now(),
                )
            });
            match recorded {
                Ok(_) => {}
                Err(LedgerError::JobNotFound(_)) => {
                    warn!(batch_id = %batch.id, job_id = %job.id, "Job deleted mid-verification, discarding failure");
                    ctx.broker.ack(seq).await?;
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
            ctx.broker
                .dead_letter(seq, error.code(), &message, attempts)
                .await?;

            ctx.metrics.job_failed();
            warn!(
                batch_id = %batch.id,
                job_id = %job.id,
                attempts,
                code = error.code(),
                error = %message,
                "Job failed"
            );

            JobOutcome {
                batch_id: batch.id.clone(),
                job_id: job.id.clone(),
                status: JobStatus::Failed,
                is_valid: None,
                proof_missing: false,
                attempts,
                error: Some(message),
                batch_completed: false,
            }
        }
    };

    let batch_completed = aggregate(ctx, &batch.id)?;
    if batch_completed {
        info!(batch_id = %batch.id, "Batch completed");
        if ctx.auto_pack {
            auto_pack(ctx, &batch.id).await;
        }
    }

    // No subscribers is fine
    let _ = ctx.outcomes.send(JobOutcome {
        batch_completed,
        ..outcome
    });
    Ok(())
}

/// Run attempts until a verdict, a definitive failure, or the retry/time
/// budget is spent. Returns the settlement and the number of attempts made.
async fn attempt_until_settled(
    ctx: &WorkerContext,
    country_code: &str,
    vat_number: &str,
    job_id: &str,
) -> (Settled, u32) {
    let started = Instant::now();
    let mut attempts: u32 = 0;
    let mut without_proof: Option<VerificationOutcome> = None;
    let mut last_error = ProtocolError::Indeterminate;
    let mut last_trace = String::new();

    loop {
        if attempts > 0 {
            let backoff = ctx.policy.backoff(attempts);
            if started.elapsed() + backoff >= ctx.job_timeout {
                warn!(job_id, attempts, "Job time budget spent");
                break;
            }
            ctx.metrics.retry();
            info!(
                job_id,
                retry = attempts,
                backoff_ms = backoff.as_millis() as u64,
                "Retrying verification"
            );
            tokio::time::sleep(backoff).await;
        }

        ctx.throttle.acquire().await;
        attempts += 1;
        debug!(job_id, attempt = attempts, country = country_code, "Verification attempt");

        let outcome = ctx.protocol.verify(country_code, vat_number).await;

        if outcome.proof_missing() {
            if !ctx.retry_missing_proof {
                return (Settled::Verified(outcome), attempts);
            }
            warn!(job_id, attempt = attempts, "Valid verdict without proof document");
            without_proof = Some(outcome);
        } else if outcome.success {
            return (Settled::Verified(outcome), attempts);
        } else if let Some(error) = outcome.error {
            if !error.is_transient() {
                if let Some(earlier) = without_proof {
                    return (Settled::Verified(earlier), attempts);
                }
                return (
                    Settled::Failed {
                        error,
                        raw_trace: outcome.raw_trace,
                    },
                    attempts,
                );
            }
            last_error = error;
            last_trace = outcome.raw_trace;
        }

        if !ctx.policy.should_retry(attempts) {
            break;
        }
    }

    // A verdict without proof beats no verdict at all
    match without_proof {
        Some(outcome) => (Settled::Verified(outcome), attempts),
        None => (
            Settled::Failed {
                error: last_error,
                raw_trace: last_trace,
            },
            attempts,
        ),
    }
}

/// Store the captured proof and turn the outcome into a verdict
async fn record_verdict(
    ctx: &WorkerContext,
    batch_id: &str,
    job_id: &str,
    outcome: VerificationOutcome,
) -> Verdict {
    let is_valid = outcome.is_valid.unwrap_or(false);

    let proof_path = match outcome.proof {
        ProofCapture::Captured(document) => {
            let key = proof_key(batch_id, job_id);
            match ctx.storage.upload(&key, document.bytes).await {
                Ok(_) => Some(key),
                Err(e) => {
                    warn!(batch_id, job_id, error = %e, "Failed to store proof document");
                    None
                }
            }
        }
        ProofCapture::Missing | ProofCapture::NotRequested => None,
    };

    Verdict {
        is_valid,
        company_name: outcome.company_name,
        company_address: outcome.company_address,
        verified_at: outcome.verified_at,
        proof_missing: is_valid && proof_path.is_none(),
        proof_path,
        raw_trace: Some(outcome.raw_trace),
    }
}

/// Recompute batch progress. Returns whether this call completed the batch.
fn aggregate(ctx: &WorkerContext, batch_id: &str) -> Result<bool> {
    let batch = ctx
        .store
        .get_batch(batch_id)?
        .ok_or_else(|| DispatchError::Ledger(LedgerError::BatchNotFound(batch_id.to_string())))?;
    let jobs = ctx.store.jobs_for_batch(batch_id)?;
    let snapshot = recompute(&batch, &jobs);

    let mut completed_now = false;
    let updated = ctx.store.update_batch(batch_id, |batch| {
        let was_completed = batch.is_completed();
        batch.apply_snapshot(&snapshot, Utc::now());
        completed_now = !was_completed && batch.is_completed();
    })?;

    debug!(
        batch_id,
        completed = updated.completed_jobs,
        total = updated.total_jobs,
        percentage = updated.percentage(),
        "Batch progress"
    );
    Ok(completed_now)
}

async fn auto_pack(ctx: &WorkerContext, batch_id: &str) {
    let Some(packager) = &ctx.packager else {
        return;
    };
    match packager.pack_batch(batch_id).await {
        Ok(archive) => info!(batch_id, archive = %archive.name, "Batch archive ready"),
        Err(PackageError::NoProofs(_)) => {
            info!(batch_id, "Batch has no proof documents, no archive built")
        }
        Err(e) => error!(batch_id, error = %e, "Automatic packaging failed"),
    }
}
