/// Fjall-based persistence layer for batches, jobs and quota accounts
///
/// This is the persistence collaborator of the verification engine. It uses
/// Fjall (an embedded LSM key-value store) to persist:
///
/// - Batches (status, counters, archive reference)
/// - Jobs (state machine position and verification result), grouped by batch
/// - Quota accounts (monthly allotment and usage per owner)
/// - Metadata (reset markers and similar bookkeeping)
///
/// Batch creation writes the batch, its jobs and the owner's quota usage in a
/// single Fjall write batch, so either all of it lands or none of it does.
///
/// ## Usage
///
/// ```rust,ignore
/// use vatproof::ledger::FjallStore;
///
/// let store = FjallStore::open("data/ledger")?;
/// store.create_batch(&batch, &jobs, Some(&account))?;
/// let jobs = store.jobs_for_batch(&batch.id)?;
/// ```
pub mod error;
pub mod partitions;
pub mod store;

pub use error::{LedgerError, Result};
pub use store::FjallStore;
