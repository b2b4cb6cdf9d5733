//! End to end: raw strings in, proof archive out, without any HTTP.

use std::io::{Cursor, Read};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;

use vatproof::batch::{BatchStatus, JobStatus};
use vatproof::config::{
    DispatcherConfig, HumanDuration, PackagerConfig, QuotaConfig, VerifierConfig,
};
use vatproof::dispatcher::{Dispatcher, JobOutcome};
use vatproof::ledger::FjallStore;
use vatproof::observability::Metrics;
use vatproof::packager::Packager;
use vatproof::packager::manifest::MANIFEST_NAME;
use vatproof::queue::{FjallQueue, TaskBroker};
use vatproof::quota::QuotaLedger;
use vatproof::storage::StorageClient;
use vatproof::submission::{EntryInput, Submission, SubmissionError, SubmissionService};
use vatproof::verifier::scripted::{Script, ScriptedTarget};
use vatproof::verifier::{Markers, ProtocolTimings, VerifierProtocol};

const OWNER: &str = "acme";

/// Durable state shared across simulated restarts
struct Durable {
    _dir: TempDir,
    store: Arc<FjallStore>,
    queue: Arc<RwLock<FjallQueue>>,
    storage: StorageClient,
    target: Arc<ScriptedTarget>,
}

/// One running instance over the durable state
struct Instance {
    service: SubmissionService,
    dispatcher: Arc<Dispatcher>,
    packager: Arc<Packager>,
    metrics: Arc<Metrics>,
    _workers: Vec<JoinHandle<()>>,
}

fn durable() -> Durable {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FjallStore::open(dir.path().join("ledger")).unwrap());
    let queue = Arc::new(RwLock::new(
        FjallQueue::open(dir.path().join("queue")).unwrap(),
    ));
    Durable {
        _dir: dir,
        store,
        queue,
        storage: StorageClient::in_memory(),
        target: Arc::new(ScriptedTarget::new()),
    }
}

fn dispatcher_config(pool_size: usize) -> DispatcherConfig {
    DispatcherConfig {
        pool_size,
        jitter_min: HumanDuration::from_millis(0),
        jitter_max: HumanDuration::from_millis(0),
        backoff_base: HumanDuration::from_millis(10),
        backoff_max: HumanDuration::from_millis(40),
        ..DispatcherConfig::default()
    }
}

fn start(durable: &Durable, pool_size: usize) -> Instance {
    let config = dispatcher_config(pool_size);
    let (broker, receivers) =
        TaskBroker::new(durable.queue.clone(), config.pool_size, config.channel_size);
    let metrics = Arc::new(Metrics::new());
    let packager = Arc::new(
        Packager::new(
            durable.store.clone(),
            durable.storage.clone(),
            PackagerConfig::default(),
        )
        .with_metrics(metrics.clone()),
    );
    let protocol = Arc::new(VerifierProtocol::with_timings(
        durable.target.clone(),
        Markers::from_config(&VerifierConfig::default()),
        ProtocolTimings {
            result_timeout: Duration::from_millis(200),
            proof_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(10),
        },
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        &config,
        durable.store.clone(),
        Arc::new(broker),
        protocol,
        durable.storage.clone(),
        Some(packager.clone()),
        metrics.clone(),
    ));
    let workers = dispatcher.start(receivers);

    let quota = Arc::new(QuotaLedger::new(
        durable.store.clone(),
        &QuotaConfig::default(),
    ));
    let service = SubmissionService::new(
        durable.store.clone(),
        quota,
        dispatcher.clone(),
        packager.clone(),
        metrics.clone(),
        1000,
    );

    Instance {
        service,
        dispatcher,
        packager,
        metrics,
        _workers: workers,
    }
}

async fn wait_for_completion(outcomes: &mut broadcast::Receiver<JobOutcome>, batch_id: &str) {
    tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            let outcome = outcomes.recv().await.unwrap();
            if outcome.batch_id == batch_id && outcome.batch_completed {
                break;
            }
        }
    })
    .await
    .expect("batch did not complete in time");
}

fn zip_entries(bytes: &[u8]) -> Vec<(String, Vec<u8>)> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
    (0..archive.len())
        .map(|idx| {
            let mut file = archive.by_index(idx).unwrap();
            let mut content = Vec::new();
            file.read_to_end(&mut content).unwrap();
            (file.name().to_string(), content)
        })
        .collect()
}

#[tokio::test]
async fn test_raw_strings_to_archive() {
    let durable = durable();
    // Two unreadable pages, then a verdict
    durable
        .target
        .push_for("12345678901", Script::page("<p>Please wait</p>"));
    durable
        .target
        .push_for("12345678901", Script::page("<p>Please wait</p>"));
    durable.target.push_for(
        "12345678901",
        Script::valid("ACME SA").with_proof(b"%PDF-1.4 acme".to_vec()),
    );
    durable
        .target
        .push_for("123456789", Script::invalid());

    let instance = start(&durable, 2);
    let mut outcomes = instance.dispatcher.subscribe();

    let confirmation = instance
        .service
        .confirm(Submission {
            owner_id: OWNER.to_string(),
            source: Some("suppliers.txt".to_string()),
            entries: ["FR12345678901", "FR 12 345 678 901", "XX123", "", "de123456789"]
                .into_iter()
                .map(EntryInput::from)
                .collect(),
        })
        .await
        .unwrap();
    assert_eq!(confirmation.total_jobs, 2);
    assert_eq!(confirmation.duplicates, 1);
    assert_eq!(confirmation.invalid, 2);

    wait_for_completion(&mut outcomes, &confirmation.batch_id).await;

    let batch = instance.service.batch(OWNER, &confirmation.batch_id).unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.source, "suppliers.txt");
    assert_eq!(batch.completed_jobs, 2);
    assert_eq!(
        batch.completed_jobs,
        batch.successful_jobs + batch.failed_jobs
    );
    assert_eq!(batch.valid_jobs, 1);

    let jobs = instance
        .service
        .batch_jobs(OWNER, &confirmation.batch_id)
        .unwrap();
    let french = jobs.iter().find(|j| j.country_code == "FR").unwrap();
    assert_eq!(french.status, JobStatus::Completed);
    assert_eq!(french.is_valid, Some(true));
    assert_eq!(french.retry_count, 2);
    assert_eq!(french.verified_name.as_deref(), Some("ACME SA"));
    let german = jobs.iter().find(|j| j.country_code == "DE").unwrap();
    assert_eq!(german.is_valid, Some(false));
    assert!(german.proof_path.is_none());

    let download = instance
        .service
        .download_archive(OWNER, &confirmation.batch_id)
        .await
        .unwrap();
    assert!(download.name.starts_with("VATProof_Export_"));
    assert_eq!(download.download_count, 1);

    let entries = zip_entries(&download.bytes);
    assert_eq!(entries.len(), 2);
    let manifest = entries
        .iter()
        .find(|(name, _)| name == MANIFEST_NAME)
        .unwrap();
    let manifest = String::from_utf8(manifest.1.clone()).unwrap();
    assert!(manifest.contains("VAT number: FR12345678901"));
    assert!(!manifest.contains("DE123456789"));

    let (proof_name, proof) = entries
        .iter()
        .find(|(name, _)| name.ends_with(".pdf"))
        .unwrap();
    assert!(proof_name.starts_with("FR12345678901_ACME SA_"));
    assert_eq!(proof.as_slice(), b"%PDF-1.4 acme");

    let metrics = instance.metrics.snapshot();
    assert_eq!(metrics.batches_created, 1);
    assert_eq!(metrics.jobs_completed, 2);
    assert_eq!(metrics.retries, 2);
    assert_eq!(metrics.archives_built, 1);

    // Built once, reused after
    let again = instance.packager.pack_batch(&confirmation.batch_id).await.unwrap();
    assert!(again.reused);
}

#[tokio::test]
async fn test_unfinished_tasks_resume_after_restart() {
    let durable = durable();
    durable
        .target
        .set_fallback(Script::valid("ACME SA").with_proof(b"%PDF".to_vec()));

    // First run has no workers: jobs are persisted and queued, nothing runs
    let first = start(&durable, 0);
    let confirmation = first
        .service
        .confirm(Submission {
            owner_id: OWNER.to_string(),
            source: None,
            entries: vec!["FR12345678901".into(), "BE0123456789".into()],
        })
        .await
        .unwrap();
    assert_eq!(durable.queue.read().await.pending().unwrap().len(), 2);
    assert_eq!(durable.target.opened_sessions(), 0);
    drop(first);

    let second = start(&durable, 2);
    let mut outcomes = second.dispatcher.subscribe();
    assert_eq!(second.dispatcher.resume().await.unwrap(), 2);
    wait_for_completion(&mut outcomes, &confirmation.batch_id).await;

    let batch = second
        .service
        .batch(OWNER, &confirmation.batch_id)
        .unwrap();
    assert!(batch.is_completed());
    assert_eq!(batch.valid_jobs, 2);
    assert!(batch.archive.is_some());
    assert!(durable.queue.read().await.pending().unwrap().is_empty());
    assert_eq!(durable.target.opened_sessions(), 2);

    // Quota was charged once, by the original submission
    let quota = second.service.quota(OWNER).await.unwrap();
    assert_eq!(quota.used, 2);
}

#[tokio::test]
async fn test_canceled_batch_is_not_resumed() {
    let durable = durable();
    durable.target.set_fallback(Script::valid("ACME SA"));

    let first = start(&durable, 0);
    let confirmation = first
        .service
        .confirm(Submission {
            owner_id: OWNER.to_string(),
            source: None,
            entries: vec!["FR12345678901".into()],
        })
        .await
        .unwrap();
    first.service.cancel(OWNER, &confirmation.batch_id).unwrap();
    drop(first);

    let second = start(&durable, 1);
    assert_eq!(second.dispatcher.resume().await.unwrap(), 1);

    // The replayed task is dropped once a worker sees the cancellation
    tokio::time::timeout(Duration::from_secs(5), async {
        while !durable.queue.read().await.pending().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("task was not acknowledged");

    let batch = second
        .service
        .batch(OWNER, &confirmation.batch_id)
        .unwrap();
    assert!(batch.cancel_requested);
    assert!(!batch.is_completed());
    let jobs = second
        .service
        .batch_jobs(OWNER, &confirmation.batch_id)
        .unwrap();
    assert_eq!(jobs[0].status, JobStatus::Pending);
    assert_eq!(durable.target.opened_sessions(), 0);
}

#[tokio::test]
async fn test_delete_waits_for_in_flight_job() {
    let durable = durable();
    durable.target.set_fallback(
        Script::valid("ACME SA")
            .with_proof(b"%PDF".to_vec())
            .after_empty_polls(10),
    );

    let instance = start(&durable, 1);
    let mut outcomes = instance.dispatcher.subscribe();
    let confirmation = instance
        .service
        .confirm(Submission {
            owner_id: OWNER.to_string(),
            source: None,
            entries: vec!["FR12345678901".into()],
        })
        .await
        .unwrap();
    let batch_id = confirmation.batch_id;

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let jobs = instance.service.batch_jobs(OWNER, &batch_id).unwrap();
            if jobs[0].status == JobStatus::Processing {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("job never started");

    instance.service.cancel(OWNER, &batch_id).unwrap();
    assert!(matches!(
        instance.service.delete(OWNER, &batch_id).await,
        Err(SubmissionError::BatchBusy(_))
    ));

    let outcome = tokio::time::timeout(Duration::from_secs(5), outcomes.recv())
        .await
        .expect("no outcome in time")
        .unwrap();
    assert_eq!(outcome.status, JobStatus::Completed);

    assert_eq!(instance.service.delete(OWNER, &batch_id).await.unwrap(), 1);
    assert!(durable.storage.list("proofs/").await.unwrap().is_empty());
    assert!(durable.queue.read().await.pending().unwrap().is_empty());
}
