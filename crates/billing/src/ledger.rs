//! Transaction and invoice ledger
//!
//! Gateway transactions are mirrored into a local ledger keyed by
//! (company, gateway transaction id). The tax snapshot is captured when a row is
//! first seen and never touched again; the fields the gateway owns are
//! overwritten on every sync.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use crate::company::Company;
use crate::error::{BillingError, BillingResult};
use crate::gateway::GatewaySubscription;
use crate::plans::format_dollars;
use crate::store::BillingStore;
use crate::tax::VatTable;

pub const TRANSACTION_TYPE_SALE: &str = "sale";
pub const TRANSACTION_STATUS_SETTLED: &str = "settled";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerRecord {
    pub company_subdomain: String,
    pub transaction_id: String,
    pub subscription_id: String,
    pub subscription_plan_id: String,
    pub subscription_country: String,
    pub subscription_vat_id: String,
    pub subscription_vat_percent: u32,
    /// Charged amount in minor units, VAT included
    pub amount: i64,
    pub transaction_type: String,
    pub transaction_status: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl LedgerRecord {
    pub fn is_invoice(&self) -> bool {
        self.transaction_type == TRANSACTION_TYPE_SALE
            && self.transaction_status == TRANSACTION_STATUS_SETTLED
    }

    pub fn includes_vat(&self) -> bool {
        self.subscription_vat_percent > 0
    }

    pub fn dollar_amount(&self) -> String {
        format_dollars(self.amount)
    }

    /// VAT portion of the amount: amount - trunc(amount / (1 + vat/100))
    pub fn vat_amount(&self) -> i64 {
        let vat = i64::from(self.subscription_vat_percent);
        if vat == 0 {
            return 0;
        }
        self.amount - self.amount * 100 / (100 + vat)
    }

    pub fn vat_dollar_amount(&self) -> String {
        format_dollars(self.vat_amount())
    }
}

/// Keeps the local ledger in step with the gateway
#[derive(Clone)]
pub struct LedgerService {
    store: Arc<dyn BillingStore>,
    vat: Arc<VatTable>,
}

impl LedgerService {
    pub fn new(store: Arc<dyn BillingStore>, vat: Arc<VatTable>) -> Self {
        Self { store, vat }
    }

    /// Upsert every transaction attached to a gateway subscription snapshot
    ///
    /// Returns the number of rows written. Order of the snapshot's transactions
    /// does not matter.
    pub async fn sync_transactions(
        &self,
        company: &Company,
        subscription: &GatewaySubscription,
    ) -> BillingResult<usize> {
        let mut written = 0;

        for transaction in &subscription.transactions {
            let amount = transaction.amount_minor_units()?;

            let mut record = match self
                .store
                .get_transaction(&company.subdomain, &transaction.id)
                .await?
            {
                Some(existing) => existing,
                None => LedgerRecord {
                    company_subdomain: company.subdomain.clone(),
                    transaction_id: transaction.id.clone(),
                    subscription_id: subscription.id.clone(),
                    subscription_plan_id: if subscription.plan_id.is_empty() {
                        company.subscription_plan_id.clone()
                    } else {
                        subscription.plan_id.clone()
                    },
                    subscription_country: company.subscription_country.clone(),
                    subscription_vat_id: company.subscription_vat_id.clone(),
                    subscription_vat_percent: self
                        .vat
                        .percent_for(&company.subscription_country, &company.subscription_vat_id),
                    amount,
                    transaction_type: String::new(),
                    transaction_status: String::new(),
                    created_at: transaction.created_at,
                    updated_at: transaction.updated_at,
                },
            };

            record.transaction_type = transaction.kind.clone();
            record.transaction_status = transaction.status.clone();
            record.amount = amount;
            record.created_at = transaction.created_at;
            record.updated_at = transaction.updated_at;

            self.store.upsert_transaction(&record).await?;
            written += 1;
        }

        tracing::debug!(
            subdomain = %company.subdomain,
            subscription_id = %subscription.id,
            transactions = written,
            "Synced gateway transactions"
        );
        Ok(written)
    }

    pub async fn find_invoices(&self, subdomain: &str) -> BillingResult<Vec<LedgerRecord>> {
        self.store.list_invoices(subdomain).await
    }

    pub async fn get_invoice(
        &self,
        subdomain: &str,
        transaction_id: &str,
    ) -> BillingResult<LedgerRecord> {
        let record = self
            .store
            .get_transaction(subdomain, transaction_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("transaction {}", transaction_id)))?;

        if !record.is_invoice() {
            return Err(BillingError::NotInvoice(transaction_id.to_string()));
        }
        Ok(record)
    }
}
