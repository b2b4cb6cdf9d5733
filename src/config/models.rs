use crate::humanize::{ByteSize, HumanDuration};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub verifier: VerifierConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub packager: PackagerConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    /// Root directory for the fjall ledger and task queue
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: ByteSize,
    #[serde(default = "default_max_entries")]
    pub max_entries_per_submission: usize,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    /// Settled batches older than this are removed with their jobs and blobs
    #[serde(default = "default_batch_retention")]
    pub batch_retention: HumanDuration,
    /// Shared secret for the `/admin` routes; they are disabled when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            data_dir: default_data_dir(),
            max_payload_bytes: default_max_payload_bytes(),
            max_entries_per_submission: default_max_entries(),
            max_concurrent_requests: default_max_concurrent_requests(),
            batch_retention: default_batch_retention(),
            admin_token: None,
        }
    }
}

impl ServerConfig {
    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("ledger")
    }

    pub fn queue_path(&self) -> PathBuf {
        self.data_dir.join("queue")
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5000))
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_max_payload_bytes() -> ByteSize {
    ByteSize(16 * 1024 * 1024) // 16 MB
}

fn default_max_entries() -> usize {
    5000
}

fn default_max_concurrent_requests() -> usize {
    64
}

fn default_batch_retention() -> HumanDuration {
    HumanDuration::from_secs(24 * 3600)
}

/// Blob storage backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    #[default]
    Local,
    Memory,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub provider: StorageProvider,
    /// Filesystem root for the `local` provider
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: StorageProvider::Local,
            root: default_storage_root(),
        }
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("data/blobs")
}

/// Worker pool, pacing and retry policy
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatcherConfig {
    /// Number of concurrent verifications in flight against the target
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_channel_size")]
    pub channel_size: usize,
    /// Lower bound of the randomized gap between attempt starts
    #[serde(default = "default_jitter_min")]
    pub jitter_min: HumanDuration,
    #[serde(default = "default_jitter_max")]
    pub jitter_max: HumanDuration,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base: HumanDuration,
    #[serde(default = "default_backoff_max")]
    pub backoff_max: HumanDuration,
    /// Overall budget for one job across all of its attempts
    #[serde(default = "default_job_timeout")]
    pub job_timeout: HumanDuration,
    /// Retry a valid verdict whose proof document never appeared
    #[serde(default = "default_true")]
    pub retry_missing_proof: bool,
    /// Build the archive as soon as a batch completes
    #[serde(default = "default_true")]
    pub auto_pack: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            channel_size: default_channel_size(),
            jitter_min: default_jitter_min(),
            jitter_max: default_jitter_max(),
            max_retries: default_max_retries(),
            backoff_base: default_backoff_base(),
            backoff_max: default_backoff_max(),
            job_timeout: default_job_timeout(),
            retry_missing_proof: true,
            auto_pack: true,
        }
    }
}

fn default_pool_size() -> usize {
    2
}

fn default_channel_size() -> usize {
    100
}

fn default_jitter_min() -> HumanDuration {
    HumanDuration::from_secs(3)
}

fn default_jitter_max() -> HumanDuration {
    HumanDuration::from_secs(8)
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base() -> HumanDuration {
    HumanDuration::from_secs(5)
}

fn default_backoff_max() -> HumanDuration {
    HumanDuration::from_secs(120)
}

fn default_job_timeout() -> HumanDuration {
    HumanDuration::from_secs(600)
}

fn default_true() -> bool {
    true
}

/// External verification target and content markers
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VerifierConfig {
    #[serde(default = "default_target_url")]
    pub target_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout: HumanDuration,
    /// Bound on waiting for a terminal result marker
    #[serde(default = "default_result_timeout")]
    pub result_timeout: HumanDuration,
    /// Bound on waiting for the proof document to materialize
    #[serde(default = "default_proof_timeout")]
    pub proof_timeout: HumanDuration,
    #[serde(default = "default_proof_poll_interval")]
    pub proof_poll_interval: HumanDuration,
    #[serde(default = "default_valid_markers")]
    pub valid_markers: Vec<String>,
    #[serde(default = "default_invalid_markers")]
    pub invalid_markers: Vec<String>,
    #[serde(default = "default_rejected_markers")]
    pub rejected_markers: Vec<String>,
    #[serde(default = "default_unavailable_markers")]
    pub unavailable_markers: Vec<String>,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            target_url: default_target_url(),
            user_agent: default_user_agent(),
            request_timeout: default_request_timeout(),
            result_timeout: default_result_timeout(),
            proof_timeout: default_proof_timeout(),
            proof_poll_interval: default_proof_poll_interval(),
            valid_markers: default_valid_markers(),
            invalid_markers: default_invalid_markers(),
            rejected_markers: default_rejected_markers(),
            unavailable_markers: default_unavailable_markers(),
        }
    }
}

fn default_target_url() -> String {
    "https://ec.europa.eu/taxation_customs/vies/".to_string()
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string()
}

fn default_request_timeout() -> HumanDuration {
    HumanDuration::from_secs(30)
}

fn default_result_timeout() -> HumanDuration {
    HumanDuration::from_secs(15)
}

fn default_proof_timeout() -> HumanDuration {
    HumanDuration::from_secs(30)
}

fn default_proof_poll_interval() -> HumanDuration {
    HumanDuration::from_secs(1)
}

fn markers(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn default_valid_markers() -> Vec<String> {
    markers(&["yes, valid vat number", "validstyle"])
}

fn default_invalid_markers() -> Vec<String> {
    markers(&["no, invalid vat number", "invalidstyle"])
}

fn default_rejected_markers() -> Vec<String> {
    markers(&["invalid_input", "the input format is not valid"])
}

fn default_unavailable_markers() -> Vec<String> {
    markers(&[
        "service_unavailable",
        "ms_unavailable",
        "ms_max_concurrent_req",
        "global_max_concurrent_req",
    ])
}

/// Monthly verification quota
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QuotaConfig {
    /// Allotment given to accounts seen for the first time
    #[serde(default = "default_monthly_allotment")]
    pub default_monthly_allotment: u32,
    /// Owners that are never metered
    #[serde(default)]
    pub unmetered_owners: Vec<String>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_monthly_allotment: default_monthly_allotment(),
            unmetered_owners: Vec::new(),
        }
    }
}

fn default_monthly_allotment() -> u32 {
    10
}

/// Archive packaging
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PackagerConfig {
    #[serde(default = "default_archive_prefix")]
    pub archive_prefix: String,
    /// Remove source proof documents once they are archived
    #[serde(default = "default_true")]
    pub delete_sources: bool,
    #[serde(default = "default_archive_max_age")]
    pub archive_max_age: HumanDuration,
}

impl Default for PackagerConfig {
    fn default() -> Self {
        Self {
            archive_prefix: default_archive_prefix(),
            delete_sources: true,
            archive_max_age: default_archive_max_age(),
        }
    }
}

fn default_archive_prefix() -> String {
    "VATProof_Export_".to_string()
}

fn default_archive_max_age() -> HumanDuration {
    HumanDuration::from_secs(2 * 3600)
}

/// Logging and diagnostic exposure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Return raw protocol traces over the API (non-production only)
    #[serde(default)]
    pub expose_traces: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            expose_traces: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
