//! Batch and Job entities with their lifecycle rules
//!
//! Owns no I/O. Jobs move through [`Job::transition`]; a batch's counters
//! and status are derived from its jobs by [`progress::recompute`] and merged
//! back with [`Batch::apply_snapshot`].

mod job;
pub mod progress;

pub use job::{Applied, Job, JobEvent, JobStatus, TransitionError, Verdict};
pub use progress::{BatchSnapshot, recompute};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    #[default]
    Created,
    Processing,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Created => "created",
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }
}

/// Where a batch's packaged archive lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRef {
    pub name: String,
    /// Blob storage key
    pub path: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub download_count: u64,
}

/// One submission: a file upload or a manual paste
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub owner_id: String,
    /// Source filename, or `"manual"`
    pub source: String,
    pub total_jobs: usize,
    pub status: BatchStatus,
    pub completed_jobs: usize,
    pub successful_jobs: usize,
    pub failed_jobs: usize,
    #[serde(default)]
    pub valid_jobs: usize,
    pub archive: Option<ArchiveRef>,
    #[serde(default)]
    pub cancel_requested: bool,
    /// Set when the batch could not be dispatched at all
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Batch {
    pub fn new(owner_id: impl Into<String>, source: impl Into<String>, total_jobs: usize) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            owner_id: owner_id.into(),
            source: source.into(),
            total_jobs,
            status: BatchStatus::Created,
            completed_jobs: 0,
            successful_jobs: 0,
            failed_jobs: 0,
            valid_jobs: 0,
            archive: None,
            cancel_requested: false,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == BatchStatus::Completed
    }

    /// No more work will be scheduled: completed, failed or canceled
    pub fn is_settled(&self) -> bool {
        self.is_completed() || self.status == BatchStatus::Failed || self.cancel_requested
    }

    /// When the batch stopped taking work, as far as the ledger knows
    pub fn settled_at(&self) -> DateTime<Utc> {
        self.completed_at.unwrap_or(self.created_at)
    }

    pub fn percentage(&self) -> u8 {
        progress::percentage(self.completed_jobs, self.total_jobs)
    }

    /// `created -> processing`, issued once when the first job is dispatched.
    /// Returns `false` if the batch had already left `created`.
    pub fn mark_processing(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != BatchStatus::Created {
            return false;
        }
        self.status = BatchStatus::Processing;
        self.started_at = Some(now);
        true
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        if self.status != BatchStatus::Completed {
            self.status = BatchStatus::Failed;
            self.error = Some(reason.into());
        }
    }

    /// Merge a recomputed snapshot without ever moving a counter backwards.
    ///
    /// Jobs only move forward, so the larger of two snapshots' counters is
    /// always the more recent one.
    pub fn apply_snapshot(&mut self, snapshot: &BatchSnapshot, now: DateTime<Utc>) {
        self.completed_jobs = self.completed_jobs.max(snapshot.completed_jobs);
        self.successful_jobs = self.successful_jobs.max(snapshot.successful_jobs);
        self.failed_jobs = self.failed_jobs.max(snapshot.failed_jobs);
        self.valid_jobs = self.valid_jobs.max(snapshot.valid_jobs);

        if self.status == BatchStatus::Completed {
            return;
        }
        match snapshot.status {
            BatchStatus::Completed => {
                self.status = BatchStatus::Completed;
                self.completed_at = Some(now);
                self.started_at.get_or_insert(now);
            }
            BatchStatus::Processing => {
                self.mark_processing(now);
            }
            _ => {}
        }
    }

    pub fn attach_archive(&mut self, name: String, path: String, now: DateTime<Utc>) {
        self.archive = Some(ArchiveRef {
            name,
            path,
            created_at: now,
            download_count: 0,
        });
    }

    /// Count one archive download. Returns the new count, or `None` without an archive.
    pub fn record_download(&mut self) -> Option<u64> {
        let archive = self.archive.as_mut()?;
        archive.download_count += 1;
        Some(archive.download_count)
    }
}
