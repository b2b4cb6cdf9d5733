//! Per-account monthly verification quota
//!
//! [`QuotaLedger::try_reserve`] is the single check-and-increment point. A
//! granted [`Reservation`] holds the ledger's lock until it is committed
//! together with the batch it pays for, or dropped (which rolls it back), so
//! two concurrent reservations can never both spend the last unit.

use chrono::{Datelike, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::batch::{Batch, Job};
use crate::config::QuotaConfig;
use crate::ledger::{FjallStore, LedgerError};

#[derive(Debug, Error)]
pub enum QuotaError {
    #[error("quota store error: {0}")]
    Ledger(#[from] LedgerError),
}

pub type Result<T> = std::result::Result<T, QuotaError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    #[default]
    Metered,
    Unmetered,
}

/// Stored usage for one owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaAccount {
    pub owner_id: String,
    pub monthly_allotment: u32,
    pub used: u32,
    /// First day of the next period
    pub reset_on: NaiveDate,
}

impl QuotaAccount {
    pub fn new(owner_id: impl Into<String>, monthly_allotment: u32, today: NaiveDate) -> Self {
        Self {
            owner_id: owner_id.into(),
            monthly_allotment,
            used: 0,
            reset_on: next_reset(today),
        }
    }

    pub fn remaining(&self) -> u32 {
        self.monthly_allotment.saturating_sub(self.used)
    }

    fn roll_over(&mut self, today: NaiveDate) -> bool {
        if today < self.reset_on {
            return false;
        }
        self.used = 0;
        self.reset_on = next_reset(today);
        true
    }
}

/// Account view returned to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub owner_id: String,
    pub plan: Plan,
    pub monthly_allotment: u32,
    pub used: u32,
    pub remaining: u32,
    pub reset_on: NaiveDate,
}

/// First day of the month after `today`
fn next_reset(today: NaiveDate) -> NaiveDate {
    let first = today.with_day(1).unwrap_or(today);
    first.checked_add_months(Months::new(1)).unwrap_or(first)
}

pub enum QuotaDecision {
    Granted(Reservation),
    Denied { available: u32 },
}

impl std::fmt::Debug for QuotaDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuotaDecision::Granted(r) => f
                .debug_struct("Granted")
                .field("owner_id", &r.owner_id)
                .field("count", &r.count)
                .finish(),
            QuotaDecision::Denied { available } => f
                .debug_struct("Denied")
                .field("available", available)
                .finish(),
        }
    }
}

/// Quota units held for one pending batch creation
#[must_use = "a reservation is rolled back unless committed"]
pub struct Reservation {
    store: Arc<FjallStore>,
    owner_id: String,
    count: u32,
    /// Updated account written on commit
    account: QuotaAccount,
    _guard: OwnedMutexGuard<()>,
}

impl Reservation {
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Persist the batch, its jobs and the charged quota in one atomic write.
    pub fn commit(self, batch: &Batch, jobs: &[Job]) -> Result<()> {
        self.store.create_batch(batch, jobs, Some(&self.account))?;
        info!(
            owner_id = %self.owner_id,
            batch_id = %batch.id,
            count = self.count,
            "Quota reservation committed"
        );
        Ok(())
    }

    /// Release the reservation without charging anything.
    pub fn rollback(self) {
        debug!(owner_id = %self.owner_id, count = self.count, "Quota reservation rolled back");
    }
}

/// Concurrency-safe quota service backed by the ledger
pub struct QuotaLedger {
    store: Arc<FjallStore>,
    default_allotment: u32,
    unmetered: HashSet<String>,
    lock: Arc<Mutex<()>>,
}

impl QuotaLedger {
    pub fn new(store: Arc<FjallStore>, config: &QuotaConfig) -> Self {
        Self {
            store,
            default_allotment: config.default_monthly_allotment,
            unmetered: config.unmetered_owners.iter().cloned().collect(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn is_unmetered(&self, owner_id: &str) -> bool {
        self.unmetered.contains(owner_id)
    }

    fn load(&self, owner_id: &str, today: NaiveDate) -> Result<QuotaAccount> {
        let mut account = self
            .store
            .get_quota(owner_id)?
            .unwrap_or_else(|| QuotaAccount::new(owner_id, self.default_allotment, today));
        account.roll_over(today);
        Ok(account)
    }

    /// Check-and-hold `count` units for `owner_id`.
    pub async fn try_reserve(&self, owner_id: &str, count: u32) -> Result<QuotaDecision> {
        let guard = self.lock.clone().lock_owned().await;

        let mut account = self.load(owner_id, Utc::now().date_naive())?;
        if !self.is_unmetered(owner_id) {
            let available = account.remaining();
            if count > available {
                warn!(owner_id, requested = count, available, "Quota reservation denied");
                return Ok(QuotaDecision::Denied { available });
            }
        }

        // Unmetered owners are never denied but their usage is still recorded
        account.used = account.used.saturating_add(count);
        debug!(owner_id, count, used = account.used, "Quota reserved");
        Ok(QuotaDecision::Granted(Reservation {
            store: self.store.clone(),
            owner_id: owner_id.to_string(),
            count,
            account,
            _guard: guard,
        }))
    }

    /// Current usage for `owner_id` without reserving anything.
    pub async fn account(&self, owner_id: &str) -> Result<QuotaStatus> {
        let _guard = self.lock.lock().await;
        let today = Utc::now().date_naive();

        let account = self.load(owner_id, today)?;
        if self.is_unmetered(owner_id) {
            return Ok(QuotaStatus {
                owner_id: account.owner_id,
                plan: Plan::Unmetered,
                monthly_allotment: u32::MAX,
                used: account.used,
                remaining: u32::MAX,
                reset_on: account.reset_on,
            });
        }

        Ok(QuotaStatus {
            owner_id: account.owner_id.clone(),
            plan: Plan::Metered,
            monthly_allotment: account.monthly_allotment,
            used: account.used,
            remaining: account.remaining(),
            reset_on: account.reset_on,
        })
    }

    /// Change the allotment of one owner, keeping current usage.
    pub async fn set_allotment(&self, owner_id: &str, monthly_allotment: u32) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut account = self.load(owner_id, Utc::now().date_naive())?;
        account.monthly_allotment = monthly_allotment;
        self.store.put_quota(&account)?;
        Ok(())
    }

    /// Zero the usage of one owner and start a new period.
    pub async fn reset(&self, owner_id: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let today = Utc::now().date_naive();
        let mut account = self.load(owner_id, today)?;
        account.used = 0;
        account.reset_on = next_reset(today);
        self.store.put_quota(&account)?;
        info!(owner_id, "Quota reset");
        Ok(())
    }

    /// Roll over every account whose period ended on or before `today`.
    pub async fn reset_due(&self, today: NaiveDate) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let mut reset = 0;
        for mut account in self.store.list_quota()? {
            if account.roll_over(today) {
                self.store.put_quota(&account)?;
                reset += 1;
            }
        }
        if reset > 0 {
            info!(reset, %today, "Monthly quota reset");
        }
        Ok(reset)
    }
}
