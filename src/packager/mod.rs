//! Bundles the proof documents of a batch into one downloadable ZIP archive
//!
//! The archive holds a plain-text manifest plus one PDF per valid job. It is
//! written to blob storage under `archives/` and referenced from the batch.

pub mod manifest;

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::io::{Cursor, Write};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use zip::CompressionMethod;
use zip::write::{FileOptions, ZipWriter};

use crate::batch::{Batch, Job, JobStatus};
use crate::config::PackagerConfig;
use crate::ledger::{FjallStore, LedgerError};
use crate::observability::Metrics;
use crate::storage::{StorageClient, StorageError};

pub const ARCHIVE_DIR: &str = "archives";

#[derive(Debug, Error)]
pub enum PackageError {
    #[error("Batch not found: {0}")]
    BatchNotFound(String),

    #[error("Batch {0} is still being verified")]
    NotCompleted(String),

    #[error("No proof document available for batch {0}")]
    NoProofs(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PackageError>;

/// A stored archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveResult {
    pub name: String,
    pub path: String,
    pub proof_count: usize,
    pub size_bytes: usize,
    /// Jobs whose proof document could not be read back from storage
    pub skipped: Vec<String>,
    pub created_at: DateTime<Utc>,
    /// An existing archive was returned instead of building a new one
    pub reused: bool,
}

/// Storage key of a job's proof document
pub fn proof_key(batch_id: &str, job_id: &str) -> String {
    format!("proofs/{}/{}.pdf", batch_id, job_id)
}

fn archive_name(prefix: &str, batch_id: &str, now: DateTime<Utc>) -> String {
    let short: String = batch_id.chars().filter(|c| *c != '-').take(8).collect();
    format!("{}{}_{}.zip", prefix, now.format("%Y%m%d_%H%M%S"), short)
}

/// Jobs that carry a proof: completed, valid and with a stored document
fn proof_jobs(jobs: &[Job]) -> Vec<&Job> {
    jobs.iter()
        .filter(|job| {
            job.status == JobStatus::Completed
                && job.is_valid == Some(true)
                && job.proof_path.is_some()
        })
        .collect()
}

pub struct Packager {
    store: Arc<FjallStore>,
    storage: StorageClient,
    config: PackagerConfig,
    metrics: Option<Arc<Metrics>>,
}

impl Packager {
    pub fn new(store: Arc<FjallStore>, storage: StorageClient, config: PackagerConfig) -> Self {
        Self {
            store,
            storage,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build and store the archive for `batch` from its successful jobs.
    ///
    /// Does not touch the ledger; see [`Packager::pack_batch`].
    pub async fn pack(&self, batch: &Batch, jobs: &[Job]) -> Result<ArchiveResult> {
        let candidates = proof_jobs(jobs);
        if candidates.is_empty() {
            return Err(PackageError::NoProofs(batch.id.clone()));
        }

        let now = Utc::now();
        let mut included: Vec<(&Job, String, Vec<u8>)> = Vec::with_capacity(candidates.len());
        let mut skipped = Vec::new();
        let mut used_names = HashSet::new();

        for job in candidates {
            let Some(key) = job.proof_path.as_deref() else {
                continue;
            };
            let bytes = match self.storage.download(key).await {
                Ok(bytes) => bytes,
                Err(StorageError::NotFound(_)) => {
                    warn!(batch_id = %batch.id, job_id = %job.id, key, "Proof document missing from storage");
                    skipped.push(job.id.clone());
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let base = manifest::proof_entry_name(job, now);
            let mut entry = format!("{}.pdf", base);
            let mut n = 1;
            while !used_names.insert(entry.clone()) {
                entry = format!("{}_{}.pdf", base, n);
                n += 1;
            }
            included.push((job, entry, bytes));
        }

        if included.is_empty() {
            return Err(PackageError::NoProofs(batch.id.clone()));
        }

        let listed: Vec<&Job> = included.iter().map(|(job, _, _)| *job).collect();
        let summary = manifest::render(&batch.id, now, &listed);

        let mut buffer = Vec::new();
        {
            let mut zip = ZipWriter::new(Cursor::new(&mut buffer));
            let options = FileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .unix_permissions(0o644);

            zip.start_file(manifest::MANIFEST_NAME, options)?;
            zip.write_all(summary.as_bytes())?;

            for (_, entry, bytes) in &included {
                zip.start_file(entry.as_str(), options)?;
                zip.write_all(bytes)?;
            }
            zip.finish()?;
        }

        let name = archive_name(&self.config.archive_prefix, &batch.id, now);
        let path = format!("{}/{}", ARCHIVE_DIR, name);
        let size_bytes = buffer.len();
        self.storage.upload(&path, buffer).await?;

        if self.config.delete_sources {
            for (job, _, _) in &included {
                if let Some(key) = job.proof_path.as_deref() {
                    if let Err(e) = self.storage.delete(key).await {
                        warn!(job_id = %job.id, key, error = %e, "Failed to delete archived proof");
                    }
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.archive_built();
        }
        info!(
            batch_id = %batch.id,
            archive = %name,
            proofs = included.len(),
            skipped = skipped.len(),
            size_bytes,
            "Archive built"
        );

        Ok(ArchiveResult {
            name,
            path,
            proof_count: included.len(),
            size_bytes,
            skipped,
            created_at: now,
            reused: false,
        })
    }

    /// Package a finished batch and record the archive on it.
    ///
    /// An archive that is already stored is returned as is. Failures leave
    /// the batch untouched.
    pub async fn pack_batch(&self, batch_id: &str) -> Result<ArchiveResult> {
        let batch = self
            .store
            .get_batch(batch_id)?
            .ok_or_else(|| PackageError::BatchNotFound(batch_id.to_string()))?;

        if !batch.is_completed() && !batch.cancel_requested {
            return Err(PackageError::NotCompleted(batch_id.to_string()));
        }

        if let Some(archive) = &batch.archive {
            if self.storage.exists(&archive.path).await? {
                return Ok(ArchiveResult {
                    name: archive.name.clone(),
                    path: archive.path.clone(),
                    proof_count: batch.valid_jobs,
                    size_bytes: 0,
                    skipped: Vec::new(),
                    created_at: archive.created_at,
                    reused: true,
                });
            }
        }

        let jobs = self.store.jobs_for_batch(batch_id)?;
        let result = self.pack(&batch, &jobs).await?;

        let (name, path, created_at) = (result.name.clone(), result.path.clone(), result.created_at);
        self.store
            .update_batch(batch_id, |batch| batch.attach_archive(name, path, created_at))?;

        Ok(result)
    }

    /// Remove stored archives older than `max_age`. Returns how many went.
    pub async fn cleanup_archives(&self, max_age: Duration) -> Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());
        let marker = format!("{}/{}", ARCHIVE_DIR, self.config.archive_prefix);

        let mut removed = 0;
        for object in self.storage.list(ARCHIVE_DIR).await? {
            if object.key.starts_with(&marker) && object.last_modified < cutoff {
                self.storage.delete(&object.key).await?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "Expired archives removed");
        }
        Ok(removed)
    }

    pub fn storage(&self) -> &StorageClient {
        &self.storage
    }
}
