//! Observability (metrics, tracing)

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init_tracing(log_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    // A second init (tests, embedded use) keeps the first subscriber
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Metrics handle for recording counters
#[derive(Debug, Default)]
pub struct Metrics {
    batches_created: AtomicU64,
    jobs_dispatched: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    retries: AtomicU64,
    proofs_missing: AtomicU64,
    quota_denied: AtomicU64,
    archives_built: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batch_created(&self) {
        self.batches_created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "batches_created", "Metric incremented");
    }

    pub fn jobs_dispatched(&self, count: u64) {
        self.jobs_dispatched.fetch_add(count, Ordering::Relaxed);
        tracing::debug!(counter = "jobs_dispatched", count, "Metric incremented");
    }

    pub fn job_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "jobs_completed", "Metric incremented");
    }

    pub fn job_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "jobs_failed", "Metric incremented");
    }

    pub fn retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "retries", "Metric incremented");
    }

    pub fn proof_missing(&self) {
        self.proofs_missing.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "proofs_missing", "Metric incremented");
    }

    pub fn quota_denied(&self) {
        self.quota_denied.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "quota_denied", "Metric incremented");
    }

    pub fn archive_built(&self) {
        self.archives_built.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "archives_built", "Metric incremented");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            batches_created: self.batches_created.load(Ordering::Relaxed),
            jobs_dispatched: self.jobs_dispatched.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            proofs_missing: self.proofs_missing.load(Ordering::Relaxed),
            quota_denied: self.quota_denied.load(Ordering::Relaxed),
            archives_built: self.archives_built.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub batches_created: u64,
    pub jobs_dispatched: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub retries: u64,
    pub proofs_missing: u64,
    pub quota_denied: u64,
    pub archives_built: u64,
}
