use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// What the verification target said about a number
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub is_valid: bool,
    pub company_name: Option<String>,
    pub company_address: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
    /// Storage key of the proof document
    pub proof_path: Option<String>,
    /// Valid verdict accepted without a proof document
    pub proof_missing: bool,
    pub raw_trace: Option<String>,
}

/// Events accepted by [`Job::transition`]
#[derive(Debug, Clone)]
pub enum JobEvent {
    Start { task_id: String },
    Succeed { verdict: Verdict, attempts: u32 },
    Fail {
        error: String,
        raw_trace: Option<String>,
        attempts: u32,
    },
}

impl JobEvent {
    fn name(&self) -> &'static str {
        match self {
            JobEvent::Start { .. } => "start",
            JobEvent::Succeed { .. } => "succeed",
            JobEvent::Fail { .. } => "fail",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Changed,
    /// Repeated start with the same task id
    Unchanged,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("job {job_id} is already {status:?} and cannot {event}")]
    Terminal {
        job_id: String,
        status: JobStatus,
        event: &'static str,
    },

    #[error("job {job_id} already started under task {current}, refusing task {requested}")]
    TaskMismatch {
        job_id: String,
        current: String,
        requested: String,
    },

    #[error("job {job_id} cannot {event} while {status:?}")]
    Invalid {
        job_id: String,
        status: JobStatus,
        event: &'static str,
    },
}

/// One (country, number) verification unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct Job {
    #[builder(default = Uuid::now_v7().to_string())]
    pub id: String,
    #[builder(into)]
    pub owner_id: String,
    #[builder(into)]
    pub batch_id: String,
    #[builder(into)]
    pub country_code: String,
    #[builder(into)]
    pub vat_number: String,
    #[builder(into)]
    pub original_input: String,
    pub line_number: usize,
    /// Company name declared by the submitter, if any
    pub company_name: Option<String>,
    #[builder(default)]
    pub status: JobStatus,
    pub task_id: Option<String>,
    pub is_valid: Option<bool>,
    pub verified_name: Option<String>,
    pub verified_address: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
    pub proof_path: Option<String>,
    #[builder(default)]
    #[serde(default)]
    pub proof_missing: bool,
    pub raw_trace: Option<String>,
    pub error: Option<String>,
    #[builder(default)]
    #[serde(default)]
    pub retry_count: u32,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn vat_display(&self) -> String {
        crate::validator::format_display(&self.country_code, &self.vat_number)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The only way a job changes status.
    ///
    /// `pending -> processing -> completed | failed`. Terminal states accept
    /// nothing; a second `Start` with the same task id is a no-op.
    pub fn transition(
        &mut self,
        event: JobEvent,
        now: DateTime<Utc>,
    ) -> Result<Applied, TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError::Terminal {
                job_id: self.id.clone(),
                status: self.status,
                event: event.name(),
            });
        }

        match (self.status, event) {
            (JobStatus::Pending, JobEvent::Start { task_id }) => {
                self.status = JobStatus::Processing;
                self.task_id = Some(task_id);
                self.started_at = Some(now);
                Ok(Applied::Changed)
            }
            (JobStatus::Processing, JobEvent::Start { task_id }) => {
                match self.task_id.as_deref() {
                    Some(current) if current == task_id => Ok(Applied::Unchanged),
                    current => Err(TransitionError::TaskMismatch {
                        job_id: self.id.clone(),
                        current: current.unwrap_or_default().to_string(),
                        requested: task_id,
                    }),
                }
            }
            (JobStatus::Processing, JobEvent::Succeed { verdict, attempts }) => {
                self.status = JobStatus::Completed;
                self.is_valid = Some(verdict.is_valid);
                self.verified_name = verdict.company_name;
                self.verified_address = verdict.company_address;
                self.verified_at = verdict.verified_at.or(Some(now));
                self.proof_path = verdict.proof_path;
                self.proof_missing = verdict.proof_missing;
                self.raw_trace = verdict.raw_trace;
                self.error = None;
                self.retry_count = attempts.saturating_sub(1);
                self.completed_at = Some(now);
                Ok(Applied::Changed)
            }
            (
                JobStatus::Processing,
                JobEvent::Fail {
                    error,
                    raw_trace,
                    attempts,
                },
            ) => {
                self.status = JobStatus::Failed;
                self.is_valid = None;
                self.raw_trace = raw_trace;
                self.error = Some(error);
                self.retry_count = attempts.saturating_sub(1);
                self.completed_at = Some(now);
                Ok(Applied::Changed)
            }
            (status, event) => Err(TransitionError::Invalid {
                job_id: self.id.clone(),
                status,
                event: event.name(),
            }),
        }
    }
}
