//! Persistence seams
//!
//! `BillingStore` holds companies and their ledger rows, `WebhookQueue` holds
//! deferred webhook tasks. Both have a Postgres implementation and an in-memory
//! one used by tests and local runs.

mod memory;
mod postgres;

pub use memory::{InMemoryBillingStore, InMemoryWebhookQueue};
pub use postgres::PgBillingStore;

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::company::Company;
use crate::error::{BillingError, BillingResult};
use crate::ledger::LedgerRecord;

/// Tasks stuck in `processing` longer than this are handed out again
pub const STUCK_TASK_TIMEOUT: time::Duration = time::Duration::minutes(30);

#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn get_company(&self, subdomain: &str) -> BillingResult<Company>;

    async fn find_company_by_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<Company>>;

    /// Fails with `SubdomainTaken` when the subdomain exists
    async fn insert_company(&self, company: &Company) -> BillingResult<()>;

    /// Write `company` only if the stored version still equals `expected_version`
    ///
    /// Returns `false` when another writer committed first. The stored version is
    /// taken from `company.version`.
    async fn update_company_if_version(
        &self,
        company: &Company,
        expected_version: i64,
    ) -> BillingResult<bool>;

    async fn team_size(&self, subdomain: &str) -> BillingResult<u32>;

    async fn get_transaction(
        &self,
        subdomain: &str,
        transaction_id: &str,
    ) -> BillingResult<Option<LedgerRecord>>;

    /// Insert or overwrite the row keyed by (company, transaction id)
    async fn upsert_transaction(&self, record: &LedgerRecord) -> BillingResult<()>;

    /// Settled sales, newest first
    async fn list_invoices(&self, subdomain: &str) -> BillingResult<Vec<LedgerRecord>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Done,
    Dropped,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Done => "done",
            TaskStatus::Dropped => "dropped",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Dropped | TaskStatus::Failed
        )
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "done" => Ok(TaskStatus::Done),
            "dropped" => Ok(TaskStatus::Dropped),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(BillingError::Internal(format!(
                "Unknown webhook task status: {}",
                other
            ))),
        }
    }
}

/// A stored webhook delivery awaiting processing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookTask {
    pub id: Uuid,
    pub signature: String,
    pub payload: String,
    pub status: TaskStatus,
    /// Claims so far, including the current one
    pub attempts: u32,
    pub run_at: OffsetDateTime,
    pub last_error: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Delayed at-least-once task queue for webhook deliveries
#[async_trait]
pub trait WebhookQueue: Send + Sync {
    async fn enqueue(
        &self,
        signature: &str,
        payload: &str,
        run_at: OffsetDateTime,
    ) -> BillingResult<Uuid>;

    /// Mark up to `limit` due tasks as processing and hand them out
    ///
    /// Tasks stuck in processing for longer than [`STUCK_TASK_TIMEOUT`] are due again.
    async fn claim_due(&self, now: OffsetDateTime, limit: u32) -> BillingResult<Vec<WebhookTask>>;

    async fn complete(
        &self,
        id: Uuid,
        status: TaskStatus,
        error: Option<&str>,
    ) -> BillingResult<()>;

    /// Put a claimed task back to pending, due at `run_at`
    async fn reschedule(&self, id: Uuid, run_at: OffsetDateTime, error: &str)
        -> BillingResult<()>;

    /// Delete finished tasks last touched before `older_than`
    async fn purge_finished(&self, older_than: OffsetDateTime) -> BillingResult<u64>;
}
