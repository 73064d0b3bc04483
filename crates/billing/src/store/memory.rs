//! In-memory stores for tests and local runs

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{BillingStore, TaskStatus, WebhookQueue, WebhookTask, STUCK_TASK_TIMEOUT};
use crate::company::Company;
use crate::error::{BillingError, BillingResult};
use crate::ledger::LedgerRecord;

#[derive(Default)]
struct BillingState {
    companies: HashMap<String, Company>,
    team_sizes: HashMap<String, u32>,
    transactions: HashMap<(String, String), LedgerRecord>,
}

/// Map-backed [`BillingStore`]
#[derive(Default)]
pub struct InMemoryBillingStore {
    state: Mutex<BillingState>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the member count reported for a company (defaults to 1)
    pub async fn set_team_size(&self, subdomain: &str, size: u32) {
        self.state
            .lock()
            .await
            .team_sizes
            .insert(subdomain.to_string(), size);
    }

    pub async fn transaction_count(&self) -> usize {
        self.state.lock().await.transactions.len()
    }
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn get_company(&self, subdomain: &str) -> BillingResult<Company> {
        self.state
            .lock()
            .await
            .companies
            .get(subdomain)
            .cloned()
            .ok_or_else(|| BillingError::CompanyNotFound(subdomain.to_string()))
    }

    async fn find_company_by_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<Company>> {
        Ok(self
            .state
            .lock()
            .await
            .companies
            .values()
            .find(|company| company.subscription_id.as_deref() == Some(subscription_id))
            .cloned())
    }

    async fn insert_company(&self, company: &Company) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        if state.companies.contains_key(&company.subdomain) {
            return Err(BillingError::SubdomainTaken(company.subdomain.clone()));
        }
        state
            .companies
            .insert(company.subdomain.clone(), company.clone());
        Ok(())
    }

    async fn update_company_if_version(
        &self,
        company: &Company,
        expected_version: i64,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        let stored = state
            .companies
            .get_mut(&company.subdomain)
            .ok_or_else(|| BillingError::CompanyNotFound(company.subdomain.clone()))?;

        if stored.version != expected_version {
            return Ok(false);
        }
        *stored = company.clone();
        Ok(true)
    }

    async fn team_size(&self, subdomain: &str) -> BillingResult<u32> {
        let state = self.state.lock().await;
        if !state.companies.contains_key(subdomain) {
            return Err(BillingError::CompanyNotFound(subdomain.to_string()));
        }
        Ok(state.team_sizes.get(subdomain).copied().unwrap_or(1))
    }

    async fn get_transaction(
        &self,
        subdomain: &str,
        transaction_id: &str,
    ) -> BillingResult<Option<LedgerRecord>> {
        Ok(self
            .state
            .lock()
            .await
            .transactions
            .get(&(subdomain.to_string(), transaction_id.to_string()))
            .cloned())
    }

    async fn upsert_transaction(&self, record: &LedgerRecord) -> BillingResult<()> {
        let key = (
            record.company_subdomain.clone(),
            record.transaction_id.clone(),
        );
        self.state
            .lock()
            .await
            .transactions
            .insert(key, record.clone());
        Ok(())
    }

    async fn list_invoices(&self, subdomain: &str) -> BillingResult<Vec<LedgerRecord>> {
        let state = self.state.lock().await;
        let mut invoices: Vec<LedgerRecord> = state
            .transactions
            .values()
            .filter(|record| record.company_subdomain == subdomain && record.is_invoice())
            .cloned()
            .collect();
        invoices.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(invoices)
    }
}

/// Map-backed [`WebhookQueue`]
#[derive(Default)]
pub struct InMemoryWebhookQueue {
    tasks: Mutex<HashMap<Uuid, WebhookTask>>,
}

impl InMemoryWebhookQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: Uuid) -> Option<WebhookTask> {
        self.tasks.lock().await.get(&id).cloned()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.lock().await.is_empty()
    }
}

#[async_trait]
impl WebhookQueue for InMemoryWebhookQueue {
    async fn enqueue(
        &self,
        signature: &str,
        payload: &str,
        run_at: OffsetDateTime,
    ) -> BillingResult<Uuid> {
        let now = OffsetDateTime::now_utc();
        let task = WebhookTask {
            id: Uuid::new_v4(),
            signature: signature.to_string(),
            payload: payload.to_string(),
            status: TaskStatus::Pending,
            attempts: 0,
            run_at,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        let id = task.id;
        self.tasks.lock().await.insert(id, task);
        Ok(id)
    }

    async fn claim_due(&self, now: OffsetDateTime, limit: u32) -> BillingResult<Vec<WebhookTask>> {
        let mut tasks = self.tasks.lock().await;
        let stuck_before = now - STUCK_TASK_TIMEOUT;

        let mut due: Vec<&mut WebhookTask> = tasks
            .values_mut()
            .filter(|task| match task.status {
                TaskStatus::Pending => task.run_at <= now,
                TaskStatus::Processing => task.updated_at <= stuck_before,
                _ => false,
            })
            .collect();
        due.sort_by_key(|task| task.run_at);

        Ok(due
            .into_iter()
            .take(limit as usize)
            .map(|task| {
                task.status = TaskStatus::Processing;
                task.attempts += 1;
                task.updated_at = now;
                task.clone()
            })
            .collect())
    }

    async fn complete(
        &self,
        id: Uuid,
        status: TaskStatus,
        error: Option<&str>,
    ) -> BillingResult<()> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| BillingError::NotFound(format!("webhook task {}", id)))?;
        task.status = status;
        task.last_error = error.map(str::to_string);
        task.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn reschedule(
        &self,
        id: Uuid,
        run_at: OffsetDateTime,
        error: &str,
    ) -> BillingResult<()> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks
            .get_mut(&id)
            .ok_or_else(|| BillingError::NotFound(format!("webhook task {}", id)))?;
        task.status = TaskStatus::Pending;
        task.run_at = run_at;
        task.last_error = Some(error.to_string());
        task.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn purge_finished(&self, older_than: OffsetDateTime) -> BillingResult<u64> {
        let mut tasks = self.tasks.lock().await;
        let before = tasks.len();
        tasks.retain(|_, task| !(task.status.is_finished() && task.updated_at < older_than));
        Ok((before - tasks.len()) as u64)
    }
}
