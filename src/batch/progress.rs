//! Batch progress derived from job states

use super::{Batch, BatchStatus, Job, JobStatus};
use serde::{Deserialize, Serialize};

/// Point-in-time counters for one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSnapshot {
    pub total_jobs: usize,
    pub pending_jobs: usize,
    pub processing_jobs: usize,
    /// Terminal jobs: `successful_jobs + failed_jobs`
    pub completed_jobs: usize,
    /// Jobs that obtained a verdict, valid or not
    pub successful_jobs: usize,
    pub failed_jobs: usize,
    pub valid_jobs: usize,
    pub percentage: u8,
    pub status: BatchStatus,
}

/// Integer floor of `completed * 100 / total`; 0 for an empty batch.
pub fn percentage(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    let pct = completed.min(total) * 100 / total;
    pct as u8
}

/// Reduce a batch's jobs into counters and a derived status.
///
/// Pure, so it is safe to call repeatedly and from concurrent workers; the
/// ledger merges results monotonically.
pub fn recompute(batch: &Batch, jobs: &[Job]) -> BatchSnapshot {
    let mut snapshot = BatchSnapshot {
        total_jobs: batch.total_jobs,
        ..BatchSnapshot::default()
    };

    for job in jobs {
        match job.status {
            JobStatus::Pending => snapshot.pending_jobs += 1,
            JobStatus::Processing => snapshot.processing_jobs += 1,
            JobStatus::Completed => {
                snapshot.successful_jobs += 1;
                if job.is_valid == Some(true) {
                    snapshot.valid_jobs += 1;
                }
            }
            JobStatus::Failed => snapshot.failed_jobs += 1,
        }
    }

    snapshot.completed_jobs = snapshot.successful_jobs + snapshot.failed_jobs;
    snapshot.percentage = percentage(snapshot.completed_jobs, snapshot.total_jobs);
    snapshot.status = derive_status(batch.status, &snapshot);
    snapshot
}

fn derive_status(current: BatchStatus, snapshot: &BatchSnapshot) -> BatchStatus {
    if snapshot.total_jobs > 0 && snapshot.completed_jobs == snapshot.total_jobs {
        return BatchStatus::Completed;
    }
    match current {
        BatchStatus::Created if snapshot.processing_jobs + snapshot.completed_jobs > 0 => {
            BatchStatus::Processing
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{JobEvent, Verdict};
    use chrono::Utc;

    fn batch_with_jobs(n: usize) -> (Batch, Vec<Job>) {
        let batch = Batch::new("owner", "manual", n);
        let jobs = (0..n)
            .map(|i| {
                Job::builder()
                    .owner_id("owner")
                    .batch_id(batch.id.clone())
                    .country_code("DE")
                    .vat_number(format!("{:09}", i))
                    .original_input(format!("DE{:09}", i))
                    .line_number(i + 1)
                    .build()
            })
            .collect();
        (batch, jobs)
    }

    fn finish(job: &mut Job, valid: Option<bool>) {
        job.transition(
            JobEvent::Start {
                task_id: format!("task-{}", job.id),
            },
            Utc::now(),
        )
        .unwrap();
        let event = match valid {
            Some(is_valid) => JobEvent::Succeed {
                verdict: Verdict {
                    is_valid,
                    ..Verdict::default()
                },
                attempts: 1,
            },
            None => JobEvent::Fail {
                error: "timeout".into(),
                raw_trace: None,
                attempts: 4,
            },
        };
        job.transition(event, Utc::now()).unwrap();
    }

    #[test]
    fn test_percentage() {
        assert_eq!(percentage(0, 0), 0);
        assert_eq!(percentage(1, 3), 33);
        assert_eq!(percentage(2, 3), 66);
        assert_eq!(percentage(3, 3), 100);
    }

    #[test]
    fn test_fresh_batch() {
        let (batch, jobs) = batch_with_jobs(3);
        let snapshot = recompute(&batch, &jobs);
        assert_eq!(snapshot.pending_jobs, 3);
        assert_eq!(snapshot.completed_jobs, 0);
        assert_eq!(snapshot.status, BatchStatus::Created);
    }

    #[test]
    fn test_partial_progress() {
        let (batch, mut jobs) = batch_with_jobs(4);
        finish(&mut jobs[0], Some(true));
        finish(&mut jobs[1], None);

        let snapshot = recompute(&batch, &jobs);
        assert_eq!(snapshot.completed_jobs, 2);
        assert_eq!(snapshot.successful_jobs, 1);
        assert_eq!(snapshot.failed_jobs, 1);
        assert_eq!(snapshot.percentage, 50);
        assert_eq!(snapshot.status, BatchStatus::Processing);
    }

    #[test]
    fn test_completion_regardless_of_order() {
        let (batch, mut jobs) = batch_with_jobs(3);
        finish(&mut jobs[2], Some(false));
        finish(&mut jobs[0], None);
        finish(&mut jobs[1], Some(true));

        let snapshot = recompute(&batch, &jobs);
        assert_eq!(snapshot.status, BatchStatus::Completed);
        assert_eq!(snapshot.completed_jobs, 3);
        assert_eq!(
            snapshot.completed_jobs,
            snapshot.successful_jobs + snapshot.failed_jobs
        );
        assert_eq!(snapshot.valid_jobs, 1);
        assert_eq!(snapshot.percentage, 100);
    }

    #[test]
    fn test_empty_batch_never_completes() {
        let (batch, jobs) = batch_with_jobs(0);
        let snapshot = recompute(&batch, &jobs);
        assert_eq!(snapshot.status, BatchStatus::Created);
        assert_eq!(snapshot.percentage, 0);
    }
}
