use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::batch::{Applied, Batch, Job, JobStatus, TransitionError};
use crate::quota::QuotaAccount;

use super::error::{LedgerError, Result};
use super::partitions::{
    decode_job_key, encode_batch_key, encode_job_index_key, encode_job_key, encode_job_prefix,
    encode_meta_key, encode_quota_key,
};

/// Fjall-backed persistence for batches, jobs and quota accounts
///
/// Every read-modify-write goes through `write_lock`, so concurrent workers
/// updating the same batch never lose each other's changes.
#[derive(Clone)]
pub struct FjallStore {
    keyspace: Keyspace,
    batches: PartitionHandle,
    jobs: PartitionHandle,
    job_index: PartitionHandle,
    quota: PartitionHandle,
    metadata: PartitionHandle,
    write_lock: Arc<Mutex<()>>,
}

impl FjallStore {
    /// Open or create a Fjall store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening Fjall store at: {}", path.display());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let keyspace = Config::new(path).open()?;

        let batches = keyspace.open_partition("batches", PartitionCreateOptions::default())?;
        let jobs = keyspace.open_partition("jobs", PartitionCreateOptions::default())?;
        let job_index = keyspace.open_partition("job_index", PartitionCreateOptions::default())?;
        let quota = keyspace.open_partition("quota", PartitionCreateOptions::default())?;
        let metadata = keyspace.open_partition("metadata", PartitionCreateOptions::default())?;

        info!("Fjall store opened successfully");
        Ok(Self {
            keyspace,
            batches,
            jobs,
            job_index,
            quota,
            metadata,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        // The guarded unit carries no state, so a poisoned lock is still usable
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read<T: DeserializeOwned>(partition: &PartitionHandle, key: Vec<u8>) -> Result<Option<T>> {
        match partition.get(key)? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    /// Create a batch, its jobs and (optionally) the owner's updated quota
    /// account in one atomic write.
    pub fn create_batch(
        &self,
        batch: &Batch,
        jobs: &[Job],
        quota: Option<&QuotaAccount>,
    ) -> Result<()> {
        let _guard = self.lock();
        let mut write = self.keyspace.batch();

        write.insert(
            &self.batches,
            encode_batch_key(&batch.id),
            serde_json::to_vec(batch)?,
        );
        for job in jobs {
            write.insert(
                &self.jobs,
                encode_job_key(&batch.id, &job.id),
                serde_json::to_vec(job)?,
            );
            write.insert(
                &self.job_index,
                encode_job_index_key(&job.id),
                batch.id.as_bytes(),
            );
        }
        if let Some(account) = quota {
            write.insert(
                &self.quota,
                encode_quota_key(&account.owner_id),
                serde_json::to_vec(account)?,
            );
        }

        write.commit()?;
        debug!(batch_id = %batch.id, jobs = jobs.len(), "Created batch");
        Ok(())
    }

    /// Get a batch by ID
    pub fn get_batch(&self, batch_id: &str) -> Result<Option<Batch>> {
        Self::read(&self.batches, encode_batch_key(batch_id))
    }

    /// Batches belonging to one owner, newest first
    pub fn list_batches(&self, owner_id: &str) -> Result<Vec<Batch>> {
        let mut batches = Vec::new();
        for item in self.batches.iter() {
            let (_, value) = item?;
            let batch: Batch = serde_json::from_slice(&value)?;
            if batch.owner_id == owner_id {
                batches.push(batch);
            }
        }
        batches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(batches)
    }

    /// Settled batches of every owner whose settle time is before `cutoff`
    pub fn batches_settled_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Batch>> {
        let mut batches = Vec::new();
        for item in self.batches.iter() {
            let (_, value) = item?;
            let batch: Batch = serde_json::from_slice(&value)?;
            if batch.is_settled() && batch.settled_at() < cutoff {
                batches.push(batch);
            }
        }
        Ok(batches)
    }

    /// Read-modify-write a batch under the store lock
    pub fn update_batch<F>(&self, batch_id: &str, mutate: F) -> Result<Batch>
    where
        F: FnOnce(&mut Batch),
    {
        let _guard = self.lock();
        let key = encode_batch_key(batch_id);
        let mut batch: Batch = Self::read(&self.batches, key.clone())?
            .ok_or_else(|| LedgerError::BatchNotFound(batch_id.to_string()))?;

        mutate(&mut batch);

        self.batches.insert(key, serde_json::to_vec(&batch)?)?;
        Ok(batch)
    }

    /// Get a job by ID via the job index
    pub fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let Some(batch_id) = self.job_index.get(encode_job_index_key(job_id))? else {
            return Ok(None);
        };
        let batch_id = String::from_utf8_lossy(&batch_id).to_string();
        Self::read(&self.jobs, encode_job_key(&batch_id, job_id))
    }

    /// All jobs of a batch, in line order
    pub fn jobs_for_batch(&self, batch_id: &str) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for item in self.jobs.prefix(encode_job_prefix(batch_id)) {
            let (key, value) = item?;
            if decode_job_key(&key).is_none() {
                return Err(LedgerError::InvalidKey(
                    String::from_utf8_lossy(&key).to_string(),
                ));
            }
            jobs.push(serde_json::from_slice::<Job>(&value)?);
        }
        jobs.sort_by_key(|job| job.line_number);
        Ok(jobs)
    }

    /// Jobs of a batch currently in `status`
    pub fn jobs_by_status(&self, batch_id: &str, status: JobStatus) -> Result<Vec<Job>> {
        Ok(self
            .jobs_for_batch(batch_id)?
            .into_iter()
            .filter(|job| job.status == status)
            .collect())
    }

    /// Apply a state-machine step to a stored job under the store lock.
    ///
    /// The job is only written back when the step changed it.
    pub fn update_job<F>(&self, job_id: &str, step: F) -> Result<(Job, Applied)>
    where
        F: FnOnce(&mut Job) -> std::result::Result<Applied, TransitionError>,
    {
        let _guard = self.lock();
        let batch_id = self
            .job_index
            .get(encode_job_index_key(job_id))?
            .map(|v| String::from_utf8_lossy(&v).to_string())
            .ok_or_else(|| LedgerError::JobNotFound(job_id.to_string()))?;

        let key = encode_job_key(&batch_id, job_id);
        let mut job: Job = Self::read(&self.jobs, key.clone())?
            .ok_or_else(|| LedgerError::JobNotFound(job_id.to_string()))?;

        let applied = step(&mut job)?;
        if applied == Applied::Changed {
            self.jobs.insert(key, serde_json::to_vec(&job)?)?;
        }
        Ok((job, applied))
    }

    /// Remove a batch together with all of its jobs
    pub fn delete_batch(&self, batch_id: &str) -> Result<usize> {
        let jobs = self.jobs_for_batch(batch_id)?;

        let _guard = self.lock();
        let mut write = self.keyspace.batch();
        for job in &jobs {
            write.remove(&self.jobs, encode_job_key(batch_id, &job.id));
            write.remove(&self.job_index, encode_job_index_key(&job.id));
        }
        write.remove(&self.batches, encode_batch_key(batch_id));
        write.commit()?;

        info!(batch_id, jobs = jobs.len(), "Deleted batch");
        Ok(jobs.len())
    }

    /// Get a quota account by owner
    pub fn get_quota(&self, owner_id: &str) -> Result<Option<QuotaAccount>> {
        Self::read(&self.quota, encode_quota_key(owner_id))
    }

    /// Store or replace a quota account
    pub fn put_quota(&self, account: &QuotaAccount) -> Result<()> {
        let _guard = self.lock();
        self.quota.insert(
            encode_quota_key(&account.owner_id),
            serde_json::to_vec(account)?,
        )?;
        Ok(())
    }

    pub fn list_quota(&self) -> Result<Vec<QuotaAccount>> {
        let mut accounts = Vec::new();
        for item in self.quota.iter() {
            let (_, value) = item?;
            accounts.push(serde_json::from_slice(&value)?);
        }
        Ok(accounts)
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.metadata.insert(encode_meta_key(key), value.as_bytes())?;
        Ok(())
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .metadata
            .get(encode_meta_key(key))?
            .map(|v| String::from_utf8_lossy(&v).to_string()))
    }

    /// Persist all pending writes to disk
    pub fn persist(&self) -> Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }
}
