//! Upstream submission interface
//!
//! Turns a raw list of VAT strings into a preview, and on confirmation into
//! a persisted batch whose jobs are handed to the dispatcher. Also serves the
//! read side (batches, jobs, quota) and archive packaging/download, always
//! scoped to the requesting owner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::batch::{Batch, Job, JobStatus};
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::ledger::{FjallStore, LedgerError};
use crate::observability::Metrics;
use crate::packager::{ArchiveResult, PackageError, Packager, proof_key};
use crate::quota::{QuotaDecision, QuotaError, QuotaLedger, QuotaStatus};
use crate::storage::StorageError;
use crate::validator::{self, ValidationReport};

#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("Submission has {count} entries, the limit is {limit}")]
    TooManyEntries { count: usize, limit: usize },

    #[error("No valid VAT number to verify")]
    NoCandidates,

    #[error("Insufficient quota: {requested} requested, {available} available")]
    QuotaExceeded { requested: u32, available: u32 },

    #[error("Batch not found: {0}")]
    BatchNotFound(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("No archive for batch {0}")]
    ArchiveNotReady(String),

    #[error("Batch {0} is still being verified, cancel it first")]
    BatchBusy(String),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Quota error: {0}")]
    Quota(#[from] QuotaError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Packaging error: {0}")]
    Package(#[from] PackageError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, SubmissionError>;

/// One submitted line: a bare VAT string, or one with a declared company
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntryInput {
    Plain(String),
    Detailed {
        vat: String,
        #[serde(default)]
        company: Option<String>,
    },
}

impl EntryInput {
    pub fn vat(&self) -> &str {
        match self {
            EntryInput::Plain(vat) => vat,
            EntryInput::Detailed { vat, .. } => vat,
        }
    }

    pub fn company(&self) -> Option<&str> {
        match self {
            EntryInput::Plain(_) => None,
            EntryInput::Detailed { company, .. } => {
                company.as_deref().filter(|c| !c.trim().is_empty())
            }
        }
    }
}

impl From<&str> for EntryInput {
    fn from(value: &str) -> Self {
        EntryInput::Plain(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub owner_id: String,
    /// File name, or `None` for pasted text
    pub source: Option<String>,
    pub entries: Vec<EntryInput>,
}

/// What confirming a submission would do
#[derive(Debug, Clone, Serialize)]
pub struct Preview {
    pub report: ValidationReport,
    pub jobs_required: usize,
    pub quota: QuotaStatus,
    pub can_submit: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Confirmation {
    pub batch_id: String,
    pub total_jobs: usize,
    pub invalid: usize,
    pub duplicates: usize,
}

/// An archive ready to stream back
#[derive(Debug, Clone)]
pub struct ArchiveDownload {
    pub name: String,
    pub bytes: Vec<u8>,
    pub download_count: u64,
}

pub struct SubmissionService {
    store: Arc<FjallStore>,
    quota: Arc<QuotaLedger>,
    dispatcher: Arc<Dispatcher>,
    packager: Arc<Packager>,
    metrics: Arc<Metrics>,
    max_entries: usize,
}

impl SubmissionService {
    pub fn new(
        store: Arc<FjallStore>,
        quota: Arc<QuotaLedger>,
        dispatcher: Arc<Dispatcher>,
        packager: Arc<Packager>,
        metrics: Arc<Metrics>,
        max_entries: usize,
    ) -> Self {
        Self {
            store,
            quota,
            dispatcher,
            packager,
            metrics,
            max_entries,
        }
    }

    fn check_size(&self, count: usize) -> Result<()> {
        if count > self.max_entries {
            return Err(SubmissionError::TooManyEntries {
                count,
                limit: self.max_entries,
            });
        }
        Ok(())
    }

    /// Validate without creating anything
    pub async fn preview(&self, owner_id: &str, entries: &[EntryInput]) -> Result<Preview> {
        self.check_size(entries.len())?;

        let report = validator::validate(entries.iter().map(EntryInput::vat));
        let jobs_required = report.valid;
        let quota = self.quota.account(owner_id).await?;
        let can_submit = jobs_required > 0 && (jobs_required as u64) <= u64::from(quota.remaining);

        Ok(Preview {
            report,
            jobs_required,
            quota,
            can_submit,
        })
    }

    /// Create the batch and its jobs, charge quota, and start verification.
    ///
    /// Quota is charged in the same atomic write that creates the jobs, so a
    /// failed creation never costs anything.
    pub async fn confirm(&self, submission: Submission) -> Result<Confirmation> {
        self.check_size(submission.entries.len())?;

        let report = validator::validate(submission.entries.iter().map(EntryInput::vat));
        let candidates = report.candidates();
        if candidates.is_empty() {
            return Err(SubmissionError::NoCandidates);
        }

        let requested = u32::try_from(candidates.len()).unwrap_or(u32::MAX);
        let reservation = match self.quota.try_reserve(&submission.owner_id, requested).await? {
            QuotaDecision::Granted(reservation) => reservation,
            QuotaDecision::Denied { available } => {
                self.metrics.quota_denied();
                return Err(SubmissionError::QuotaExceeded {
                    requested,
                    available,
                });
            }
        };

        let companies: HashMap<usize, &str> = submission
            .entries
            .iter()
            .enumerate()
            .filter_map(|(idx, entry)| entry.company().map(|c| (idx + 1, c)))
            .collect();

        let source = submission
            .source
            .clone()
            .unwrap_or_else(|| "manual".to_string());
        let batch = Batch::new(submission.owner_id.clone(), source, candidates.len());
        let jobs: Vec<Job> = candidates
            .iter()
            .map(|candidate| {
                Job::builder()
                    .owner_id(submission.owner_id.clone())
                    .batch_id(batch.id.clone())
                    .country_code(candidate.country_code.clone())
                    .vat_number(candidate.number.clone())
                    .original_input(candidate.original.clone())
                    .line_number(candidate.line_number)
                    .maybe_company_name(
                        companies
                            .get(&candidate.line_number)
                            .map(|c| c.trim().to_string()),
                    )
                    .build()
            })
            .collect();

        reservation.commit(&batch, &jobs)?;
        self.metrics.batch_created();
        info!(
            batch_id = %batch.id,
            owner_id = %batch.owner_id,
            jobs = jobs.len(),
            invalid = report.invalid,
            duplicates = report.duplicates,
            "Batch created"
        );

        if let Err(e) = self.dispatcher.submit(&batch, &jobs).await {
            error!(batch_id = %batch.id, error = %e, "Failed to hand batch to dispatcher");
            // Whatever was enqueued must not run for a failed batch
            self.store.update_batch(&batch.id, |batch| {
                batch.cancel_requested = true;
                batch.mark_failed(format!("dispatch failed: {}", e));
            })?;
            return Err(e.into());
        }

        Ok(Confirmation {
            batch_id: batch.id,
            total_jobs: jobs.len(),
            invalid: report.invalid,
            duplicates: report.duplicates,
        })
    }

    /// A batch the owner may see
    pub fn batch(&self, owner_id: &str, batch_id: &str) -> Result<Batch> {
        match self.store.get_batch(batch_id)? {
            Some(batch) if batch.owner_id == owner_id => Ok(batch),
            _ => Err(SubmissionError::BatchNotFound(batch_id.to_string())),
        }
    }

    pub fn batches(&self, owner_id: &str) -> Result<Vec<Batch>> {
        Ok(self.store.list_batches(owner_id)?)
    }

    pub fn batch_jobs(&self, owner_id: &str, batch_id: &str) -> Result<Vec<Job>> {
        let batch = self.batch(owner_id, batch_id)?;
        Ok(self.store.jobs_for_batch(&batch.id)?)
    }

    pub fn job(&self, owner_id: &str, job_id: &str) -> Result<Job> {
        match self.store.get_job(job_id)? {
            Some(job) if job.owner_id == owner_id => Ok(job),
            _ => Err(SubmissionError::JobNotFound(job_id.to_string())),
        }
    }

    pub fn cancel(&self, owner_id: &str, batch_id: &str) -> Result<Batch> {
        let batch = self.batch(owner_id, batch_id)?;
        Ok(self.dispatcher.cancel(&batch.id)?)
    }

    /// Remove a settled batch with its jobs, proofs and archive.
    ///
    /// A canceled batch still counts as busy while one of its jobs is
    /// mid-verification. Returns the number of jobs removed.
    pub async fn delete(&self, owner_id: &str, batch_id: &str) -> Result<usize> {
        let batch = self.batch(owner_id, batch_id)?;
        let removed = self.remove(&batch).await?;
        info!(batch_id, owner_id, jobs = removed, "Batch deleted");
        Ok(removed)
    }

    /// Remove every settled batch that settled more than `max_age` ago.
    /// Batches with a job still in flight are left for a later pass.
    pub async fn expire_batches(&self, max_age: Duration) -> Result<usize> {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(max_age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut expired = 0;
        for batch in self.store.batches_settled_before(cutoff)? {
            match self.remove(&batch).await {
                Ok(jobs) => {
                    debug!(batch_id = %batch.id, jobs, "Expired batch removed");
                    expired += 1;
                }
                Err(SubmissionError::BatchBusy(_)) => {}
                Err(e) => warn!(batch_id = %batch.id, error = %e, "Failed to expire batch"),
            }
        }
        Ok(expired)
    }

    async fn remove(&self, batch: &Batch) -> Result<usize> {
        let jobs = self.store.jobs_for_batch(&batch.id)?;
        let in_flight = jobs
            .iter()
            .filter(|job| job.status == JobStatus::Processing)
            .count();
        if !batch.is_settled() || in_flight > 0 {
            debug!(batch_id = %batch.id, in_flight, "Batch still busy, not removed");
            return Err(SubmissionError::BatchBusy(batch.id.clone()));
        }

        let storage = self.packager.storage();
        let mut blobs: Vec<String> = jobs
            .iter()
            .map(|job| proof_key(&batch.id, &job.id))
            .collect();
        blobs.extend(jobs.iter().filter_map(|job| job.proof_path.clone()));
        blobs.extend(batch.archive.as_ref().map(|archive| archive.path.clone()));
        blobs.sort();
        blobs.dedup();
        for path in &blobs {
            match storage.delete(path).await {
                Ok(()) | Err(StorageError::NotFound(_)) => {}
                Err(e) => warn!(batch_id = %batch.id, path = %path, error = %e, "Failed to delete blob"),
            }
        }

        Ok(self.store.delete_batch(&batch.id)?)
    }

    pub async fn pack(&self, owner_id: &str, batch_id: &str) -> Result<ArchiveResult> {
        let batch = self.batch(owner_id, batch_id)?;
        Ok(self.packager.pack_batch(&batch.id).await?)
    }

    /// Fetch the archive bytes and count the download
    pub async fn download_archive(&self, owner_id: &str, batch_id: &str) -> Result<ArchiveDownload> {
        let batch = self.batch(owner_id, batch_id)?;
        let Some(archive) = batch.archive else {
            return Err(SubmissionError::ArchiveNotReady(batch_id.to_string()));
        };

        let bytes = match self.packager.storage().download(&archive.path).await {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound(_)) => {
                warn!(batch_id, path = %archive.path, "Archive expired from storage");
                return Err(SubmissionError::ArchiveNotReady(batch_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut download_count = 0;
        self.store.update_batch(batch_id, |batch| {
            download_count = batch.record_download().unwrap_or_default();
        })?;
        info!(batch_id, download_count, "Archive downloaded");

        Ok(ArchiveDownload {
            name: archive.name,
            bytes,
            download_count,
        })
    }

    pub async fn quota(&self, owner_id: &str) -> Result<QuotaStatus> {
        Ok(self.quota.account(owner_id).await?)
    }
}
