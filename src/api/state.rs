use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::ledger::FjallStore;
use crate::observability::Metrics;
use crate::packager::Packager;
use crate::queue::{FjallQueue, TaskBroker};
use crate::quota::QuotaLedger;
use crate::storage::StorageClient;
use crate::submission::SubmissionService;
use crate::verifier::{VerificationTarget, VerifierProtocol};

pub type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Ledger metadata key holding the time of the last housekeeping pass
pub const LAST_MAINTENANCE_KEY: &str = "last_maintenance";

/// What one housekeeping pass removed or reset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub archives_removed: usize,
    pub quota_resets: usize,
    pub batches_expired: usize,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub submissions: Arc<SubmissionService>,
    pub store: Arc<FjallStore>,
    pub queue: Arc<RwLock<FjallQueue>>,
    pub dispatcher: Arc<Dispatcher>,
    pub packager: Arc<Packager>,
    pub quota: Arc<QuotaLedger>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    /// Open the ledger and queue under `server.data_dir`, start the worker
    /// pool against `target`, and replay tasks left over from a previous run.
    pub async fn assemble(
        config: Config,
        target: Arc<dyn VerificationTarget>,
        storage: StorageClient,
    ) -> Result<(Self, Vec<JoinHandle<()>>), AnyError> {
        let ledger_path = config.server.ledger_path();
        info!(path = %ledger_path.display(), "Opening ledger");
        let store = Arc::new(
            FjallStore::open(&ledger_path)
                .map_err(|e| format!("Failed to open ledger: {}", e))?,
        );

        let queue_path = config.server.queue_path();
        info!(path = %queue_path.display(), "Opening task queue");
        let queue = Arc::new(RwLock::new(
            FjallQueue::open(&queue_path).map_err(|e| format!("Failed to open queue: {}", e))?,
        ));

        let (broker, receivers) = TaskBroker::new(
            queue.clone(),
            config.dispatcher.pool_size,
            config.dispatcher.channel_size,
        );
        let broker = Arc::new(broker);

        let metrics = Arc::new(Metrics::new());
        let packager = Arc::new(
            Packager::new(store.clone(), storage.clone(), config.packager.clone())
                .with_metrics(metrics.clone()),
        );
        let protocol = Arc::new(VerifierProtocol::new(target, &config.verifier));
        let dispatcher = Arc::new(Dispatcher::new(
            &config.dispatcher,
            store.clone(),
            broker,
            protocol,
            storage,
            Some(packager.clone()),
            metrics.clone(),
        ));
        let workers = dispatcher.start(receivers);

        let replayed = dispatcher
            .resume()
            .await
            .map_err(|e| format!("Failed to replay queued tasks: {}", e))?;
        if replayed > 0 {
            info!(replayed, "Resumed unfinished verifications");
        }

        let quota = Arc::new(QuotaLedger::new(store.clone(), &config.quota));
        let submissions = Arc::new(SubmissionService::new(
            store.clone(),
            quota.clone(),
            dispatcher.clone(),
            packager.clone(),
            metrics.clone(),
            config.server.max_entries_per_submission,
        ));

        let state = Self {
            config: Arc::new(config),
            submissions,
            store,
            queue,
            dispatcher,
            packager,
            quota,
            metrics,
        };
        Ok((state, workers))
    }

    pub fn expose_traces(&self) -> bool {
        self.config.telemetry.expose_traces
    }

    /// One housekeeping pass: expire archives and settled batches, roll over
    /// quota periods, then stamp the pass time in the ledger.
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        let archive_max_age = self.config.packager.archive_max_age.as_duration();
        match self.packager.cleanup_archives(archive_max_age).await {
            Ok(removed) => report.archives_removed = removed,
            Err(e) => error!(error = %e, "Archive cleanup failed"),
        }

        match self.quota.reset_due(Utc::now().date_naive()).await {
            Ok(reset) => report.quota_resets = reset,
            Err(e) => error!(error = %e, "Quota reset failed"),
        }

        let retention = self.config.server.batch_retention.as_duration();
        match self.submissions.expire_batches(retention).await {
            Ok(expired) => report.batches_expired = expired,
            Err(e) => error!(error = %e, "Batch expiry failed"),
        }

        if let Err(e) = self
            .store
            .set_meta(LAST_MAINTENANCE_KEY, &Utc::now().to_rfc3339())
        {
            error!(error = %e, "Failed to record maintenance time");
        }

        if report != MaintenanceReport::default() {
            info!(
                archives_removed = report.archives_removed,
                quota_resets = report.quota_resets,
                batches_expired = report.batches_expired,
                "Maintenance pass done"
            );
        }
        report
    }
}
