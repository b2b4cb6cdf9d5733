//! Request and response bodies of the HTTP surface.
//!
//! A submission carries its VAT strings either as a JSON list or as pasted
//! text (one entry per line):
//!
//! ```json
//! {
//!   "source": "suppliers.csv",
//!   "entries": ["FR12345678901", {"vat": "DE123456789", "company": "Beta GmbH"}]
//! }
//! ```
//!
//! Batches and jobs are returned as stored, except that a job's `raw_trace`
//! is only included when traces are exposed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::batch::{Batch, BatchStatus, Job, JobStatus};
use crate::observability::MetricsSnapshot;
use crate::packager::ArchiveResult;
use crate::queue::DeadLetterTask;
use crate::submission::EntryInput;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SubmissionRequest {
    /// Originating file name; omitted for pasted text
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub entries: Vec<EntryInput>,
    /// Pasted text, one VAT string per line
    #[serde(default)]
    pub text: Option<String>,
}

impl SubmissionRequest {
    /// All entries, listed ones first, then pasted lines
    pub fn into_entries(self) -> Vec<EntryInput> {
        let mut entries = self.entries;
        if let Some(text) = self.text {
            entries.extend(text.lines().map(EntryInput::from));
        }
        entries
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BatchCreatedResponse {
    pub batch_id: String,
    pub total_jobs: usize,
    pub invalid: usize,
    pub duplicates: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ArchiveView {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub download_count: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BatchView {
    pub id: String,
    pub source: String,
    pub status: BatchStatus,
    pub total_jobs: usize,
    pub completed_jobs: usize,
    pub successful_jobs: usize,
    pub failed_jobs: usize,
    pub valid_jobs: usize,
    pub percentage: u8,
    pub cancel_requested: bool,
    pub error: Option<String>,
    pub archive: Option<ArchiveView>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Batch> for BatchView {
    fn from(batch: Batch) -> Self {
        let percentage = batch.percentage();
        Self {
            id: batch.id,
            source: batch.source,
            status: batch.status,
            total_jobs: batch.total_jobs,
            completed_jobs: batch.completed_jobs,
            successful_jobs: batch.successful_jobs,
            failed_jobs: batch.failed_jobs,
            valid_jobs: batch.valid_jobs,
            percentage,
            cancel_requested: batch.cancel_requested,
            error: batch.error,
            archive: batch.archive.map(|archive| ArchiveView {
                name: archive.name,
                created_at: archive.created_at,
                download_count: archive.download_count,
            }),
            created_at: batch.created_at,
            started_at: batch.started_at,
            completed_at: batch.completed_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JobView {
    pub id: String,
    pub batch_id: String,
    pub vat_number: String,
    pub country_code: String,
    pub original_input: String,
    pub line_number: usize,
    pub company_name: Option<String>,
    pub status: JobStatus,
    pub is_valid: Option<bool>,
    pub verified_name: Option<String>,
    pub verified_address: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
    pub has_proof: bool,
    pub proof_missing: bool,
    pub error: Option<String>,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_trace: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobView {
    pub fn from_job(job: Job, expose_traces: bool) -> Self {
        Self {
            vat_number: job.vat_display(),
            id: job.id,
            batch_id: job.batch_id,
            country_code: job.country_code,
            original_input: job.original_input,
            line_number: job.line_number,
            company_name: job.company_name,
            status: job.status,
            is_valid: job.is_valid,
            verified_name: job.verified_name,
            verified_address: job.verified_address,
            verified_at: job.verified_at,
            has_proof: job.proof_path.is_some(),
            proof_missing: job.proof_missing,
            error: job.error,
            retry_count: job.retry_count,
            raw_trace: job.raw_trace.filter(|_| expose_traces),
            created_at: job.created_at,
            completed_at: job.completed_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ArchiveResponse {
    pub name: String,
    pub proof_count: usize,
    pub size_bytes: usize,
    pub skipped: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub reused: bool,
}

impl From<ArchiveResult> for ArchiveResponse {
    fn from(result: ArchiveResult) -> Self {
        Self {
            name: result.name,
            proof_count: result.proof_count,
            size_bytes: result.size_bytes,
            skipped: result.skipped,
            created_at: result.created_at,
            reused: result.reused,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub components: BTreeMap<String, String>,
    pub version: String,
    /// RFC 3339 time of the last housekeeping pass, if one ran
    pub last_maintenance: Option<String>,
    pub metrics: MetricsSnapshot,
}

/// Body of `PUT /admin/quota/{owner}`
#[derive(Debug, Deserialize)]
pub struct AllotmentRequest {
    pub monthly_allotment: u32,
}

#[derive(Debug, Serialize)]
pub struct QuotaResetResponse {
    pub reset: usize,
}

/// One dead-lettered job as listed by `GET /admin/dead-letters`
#[derive(Debug, Serialize)]
pub struct DeadLetterView {
    pub seq: u64,
    pub job_id: String,
    pub batch_id: String,
    pub owner_id: String,
    pub vat: String,
    pub failure_code: String,
    pub failure_message: String,
    pub attempts: u32,
    pub failed_at_ms: u64,
}

impl DeadLetterView {
    pub fn new(seq: u64, dead: DeadLetterTask) -> Self {
        Self {
            seq,
            vat: format!("{}{}", dead.task.country_code, dead.task.vat_number),
            job_id: dead.task.job_id,
            batch_id: dead.task.batch_id,
            owner_id: dead.task.owner_id,
            failure_code: dead.failure_code,
            failure_message: dead.failure_message,
            attempts: dead.attempts,
            failed_at_ms: dead.failed_at_ms,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    #[serde(default = "default_dead_letter_limit")]
    pub limit: usize,
}

fn default_dead_letter_limit() -> usize {
    100
}
