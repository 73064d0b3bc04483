//! Postgres-backed stores

use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{BillingStore, TaskStatus, WebhookQueue, WebhookTask, STUCK_TASK_TIMEOUT};
use crate::company::{Company, SubscriptionStatus};
use crate::error::{BillingError, BillingResult};
use crate::ledger::{LedgerRecord, TRANSACTION_STATUS_SETTLED, TRANSACTION_TYPE_SALE};

const COMPANY_COLUMNS: &str = "subdomain, name, subscription_plan_id, subscription_status, \
     subscription_id, subscription_customer_id, subscription_payment_token, \
     subscription_valid_until, subscription_country, subscription_vat_id, version, \
     created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "company_subdomain, transaction_id, subscription_id, \
     subscription_plan_id, subscription_country, subscription_vat_id, subscription_vat_percent, \
     amount, transaction_type, transaction_status, created_at, updated_at";

#[derive(Debug, FromRow)]
struct CompanyRow {
    subdomain: String,
    name: String,
    subscription_plan_id: String,
    subscription_status: String,
    subscription_id: Option<String>,
    subscription_customer_id: Option<String>,
    subscription_payment_token: Option<String>,
    subscription_valid_until: Option<OffsetDateTime>,
    subscription_country: String,
    subscription_vat_id: String,
    version: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<CompanyRow> for Company {
    type Error = BillingError;

    fn try_from(row: CompanyRow) -> Result<Self, Self::Error> {
        let subscription_status = SubscriptionStatus::from_gateway(&row.subscription_status)
            .ok_or_else(|| {
                BillingError::Internal(format!(
                    "Company {} has unknown subscription status '{}'",
                    row.subdomain, row.subscription_status
                ))
            })?;

        Ok(Company {
            subdomain: row.subdomain,
            name: row.name,
            subscription_plan_id: row.subscription_plan_id,
            subscription_status,
            subscription_id: row.subscription_id,
            subscription_customer_id: row.subscription_customer_id,
            subscription_payment_token: row.subscription_payment_token,
            subscription_valid_until: row.subscription_valid_until,
            subscription_country: row.subscription_country,
            subscription_vat_id: row.subscription_vat_id,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct TransactionRow {
    company_subdomain: String,
    transaction_id: String,
    subscription_id: String,
    subscription_plan_id: String,
    subscription_country: String,
    subscription_vat_id: String,
    subscription_vat_percent: i32,
    amount: i64,
    transaction_type: String,
    transaction_status: String,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<TransactionRow> for LedgerRecord {
    fn from(row: TransactionRow) -> Self {
        LedgerRecord {
            company_subdomain: row.company_subdomain,
            transaction_id: row.transaction_id,
            subscription_id: row.subscription_id,
            subscription_plan_id: row.subscription_plan_id,
            subscription_country: row.subscription_country,
            subscription_vat_id: row.subscription_vat_id,
            subscription_vat_percent: u32::try_from(row.subscription_vat_percent).unwrap_or(0),
            amount: row.amount,
            transaction_type: row.transaction_type,
            transaction_status: row.transaction_status,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct TaskRow {
    id: Uuid,
    signature: String,
    payload: String,
    status: String,
    attempts: i32,
    run_at: OffsetDateTime,
    last_error: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<TaskRow> for WebhookTask {
    type Error = BillingError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(WebhookTask {
            id: row.id,
            signature: row.signature,
            payload: row.payload,
            status: row.status.parse()?,
            attempts: u32::try_from(row.attempts).unwrap_or(0),
            run_at: row.run_at,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Postgres implementation of [`BillingStore`] and [`WebhookQueue`]
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn get_company(&self, subdomain: &str) -> BillingResult<Company> {
        let row: Option<CompanyRow> = sqlx::query_as(&format!(
            "SELECT {} FROM companies WHERE subdomain = $1",
            COMPANY_COLUMNS
        ))
        .bind(subdomain)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| BillingError::CompanyNotFound(subdomain.to_string()))?
            .try_into()
    }

    async fn find_company_by_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<Company>> {
        let row: Option<CompanyRow> = sqlx::query_as(&format!(
            "SELECT {} FROM companies WHERE subscription_id = $1",
            COMPANY_COLUMNS
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Company::try_from).transpose()
    }

    async fn insert_company(&self, company: &Company) -> BillingResult<()> {
        let result = sqlx::query(&format!(
            "INSERT INTO companies ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            COMPANY_COLUMNS
        ))
        .bind(&company.subdomain)
        .bind(&company.name)
        .bind(&company.subscription_plan_id)
        .bind(company.subscription_status.as_str())
        .bind(&company.subscription_id)
        .bind(&company.subscription_customer_id)
        .bind(&company.subscription_payment_token)
        .bind(company.subscription_valid_until)
        .bind(&company.subscription_country)
        .bind(&company.subscription_vat_id)
        .bind(company.version)
        .bind(company.created_at)
        .bind(company.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => {
                Err(BillingError::SubdomainTaken(company.subdomain.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_company_if_version(
        &self,
        company: &Company,
        expected_version: i64,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE companies SET
                name = $2,
                subscription_plan_id = $3,
                subscription_status = $4,
                subscription_id = $5,
                subscription_customer_id = $6,
                subscription_payment_token = $7,
                subscription_valid_until = $8,
                subscription_country = $9,
                subscription_vat_id = $10,
                version = $11,
                updated_at = $12
            WHERE subdomain = $1 AND version = $13
            "#,
        )
        .bind(&company.subdomain)
        .bind(&company.name)
        .bind(&company.subscription_plan_id)
        .bind(company.subscription_status.as_str())
        .bind(&company.subscription_id)
        .bind(&company.subscription_customer_id)
        .bind(&company.subscription_payment_token)
        .bind(company.subscription_valid_until)
        .bind(&company.subscription_country)
        .bind(&company.subscription_vat_id)
        .bind(company.version)
        .bind(company.updated_at)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn team_size(&self, subdomain: &str) -> BillingResult<u32> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM users WHERE company_subdomain = $1")
                .bind(subdomain)
                .fetch_one(&self.pool)
                .await?;

        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    async fn get_transaction(
        &self,
        subdomain: &str,
        transaction_id: &str,
    ) -> BillingResult<Option<LedgerRecord>> {
        let row: Option<TransactionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM billing_transactions WHERE company_subdomain = $1 AND transaction_id = $2",
            TRANSACTION_COLUMNS
        ))
        .bind(subdomain)
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(LedgerRecord::from))
    }

    async fn upsert_transaction(&self, record: &LedgerRecord) -> BillingResult<()> {
        // The tax snapshot columns are only written on insert
        sqlx::query(&format!(
            r#"
            INSERT INTO billing_transactions ({})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (company_subdomain, transaction_id) DO UPDATE SET
                amount = EXCLUDED.amount,
                transaction_type = EXCLUDED.transaction_type,
                transaction_status = EXCLUDED.transaction_status,
                created_at = EXCLUDED.created_at,
                updated_at = EXCLUDED.updated_at
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(&record.company_subdomain)
        .bind(&record.transaction_id)
        .bind(&record.subscription_id)
        .bind(&record.subscription_plan_id)
        .bind(&record.subscription_country)
        .bind(&record.subscription_vat_id)
        .bind(i32::try_from(record.subscription_vat_percent).unwrap_or(i32::MAX))
        .bind(record.amount)
        .bind(&record.transaction_type)
        .bind(&record.transaction_status)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_invoices(&self, subdomain: &str) -> BillingResult<Vec<LedgerRecord>> {
        let rows: Vec<TransactionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM billing_transactions
            WHERE company_subdomain = $1 AND transaction_type = $2 AND transaction_status = $3
            ORDER BY created_at DESC
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(subdomain)
        .bind(TRANSACTION_TYPE_SALE)
        .bind(TRANSACTION_STATUS_SETTLED)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(LedgerRecord::from).collect())
    }
}

#[async_trait]
impl WebhookQueue for PgBillingStore {
    async fn enqueue(
        &self,
        signature: &str,
        payload: &str,
        run_at: OffsetDateTime,
    ) -> BillingResult<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO billing_webhook_tasks (id, signature, payload, status, run_at)
            VALUES ($1, $2, $3, 'pending', $4)
            "#,
        )
        .bind(id)
        .bind(signature)
        .bind(payload)
        .bind(run_at)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn claim_due(&self, now: OffsetDateTime, limit: u32) -> BillingResult<Vec<WebhookTask>> {
        // SKIP LOCKED lets several workers drain the queue without handing out a task twice
        let rows: Vec<TaskRow> = sqlx::query_as(
            r#"
            UPDATE billing_webhook_tasks SET
                status = 'processing',
                attempts = attempts + 1,
                updated_at = $1
            WHERE id IN (
                SELECT id FROM billing_webhook_tasks
                WHERE (status = 'pending' AND run_at <= $1)
                   OR (status = 'processing' AND updated_at <= $2)
                ORDER BY run_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, signature, payload, status, attempts, run_at, last_error,
                      created_at, updated_at
            "#,
        )
        .bind(now)
        .bind(now - STUCK_TASK_TIMEOUT)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(WebhookTask::try_from).collect()
    }

    async fn complete(
        &self,
        id: Uuid,
        status: TaskStatus,
        error: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE billing_webhook_tasks
            SET status = $2, last_error = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn reschedule(
        &self,
        id: Uuid,
        run_at: OffsetDateTime,
        error: &str,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE billing_webhook_tasks
            SET status = 'pending', run_at = $2, last_error = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(run_at)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn purge_finished(&self, older_than: OffsetDateTime) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM billing_webhook_tasks
            WHERE status IN ('done', 'dropped', 'failed') AND updated_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
