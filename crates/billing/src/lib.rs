// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries gateway messages
#![allow(clippy::too_many_arguments)] // Service wiring takes every collaborator explicitly
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Teamzones Billing Module
//!
//! Keeps each company's subscription consistent between the local store and the
//! payment gateway.
//!
//! ## Features
//!
//! - **Plan Catalog**: Static plans loaded at start-up, self-service eligibility
//! - **Tax**: VAT lookup, floor-rounded VAT-inclusive prices, VIES VAT ID checks
//! - **Lifecycle**: Sign-up, plan changes, cancellation and re-subscription under
//!   optimistic per-company transactions
//! - **Webhooks**: Signed gateway notifications, queued and processed out of band
//! - **Ledger**: Idempotent mirror of gateway transactions, exposed as invoices

pub mod company;
pub mod config;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod plans;
pub mod queue;
pub mod store;
pub mod subscriptions;
pub mod tax;
pub mod webhooks;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use sqlx::PgPool;

// Company
pub use company::{Company, SubscriptionStatus};

// Config
pub use config::{BillingConfig, ResolutionStrategy};

// Error
pub use error::{BillingError, BillingResult, ErrorClass};

// Gateway
pub use gateway::{
    CustomerDetails, GatewayConfig, GatewaySubscription, GatewayTransaction, HttpGateway,
    PaymentGateway,
};

// Ledger
pub use ledger::{LedgerRecord, LedgerService};

// Plans
pub use plans::{BillingCycle, Plan, PlanCatalog, FREE_PLAN_ID};

// Queue
pub use queue::{
    BackoffResolution, DeliveryPolicy, DispatchSummary, FailureClass, FixedDelay,
    WebhookDispatcher,
};

// Store
pub use store::{
    BillingStore, InMemoryBillingStore, InMemoryWebhookQueue, PgBillingStore, TaskStatus,
    WebhookQueue, WebhookTask,
};

// Subscriptions
pub use subscriptions::{SignUp, SubscribeRequest, SubscriptionService, SubscriptionSummary};

// Tax
pub use tax::{effective_price, resubscribe_discount, VatIdVerifier, VatTable, ViesClient};

// Webhooks
pub use webhooks::{
    Notification, NotificationKind, ProcessOutcome, ReconciliationSnapshot, ReconciliationStats,
    WebhookHandler, WebhookIngestor, WebhookVerifier,
};

/// Main billing service that wires every billing component together
#[derive(Clone)]
pub struct BillingService {
    pub subscriptions: SubscriptionService,
    pub ledger: LedgerService,
    pub webhooks: WebhookHandler,
    pub ingestor: WebhookIngestor,
    pub dispatcher: WebhookDispatcher,
    pub queue: Arc<dyn WebhookQueue>,
    pub stats: Arc<ReconciliationStats>,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        Self::from_config(&config, pool)
    }

    /// Create a Postgres-backed billing service with explicit config
    pub fn from_config(config: &BillingConfig, pool: PgPool) -> BillingResult<Self> {
        let catalog = PlanCatalog::from_json_file(&config.plans_path)?;
        let vat = match &config.vat_rates_path {
            Some(path) => VatTable::from_json_file(path)?,
            None => VatTable::eu_default(),
        };
        let gateway = HttpGateway::new(config.gateway.clone())?;
        let vies = ViesClient::new(config.vies_url.clone())?;
        let store = Arc::new(PgBillingStore::new(pool));

        tracing::info!(
            plans = catalog.plans().len(),
            resolution = ?config.resolution,
            "Billing service configured"
        );

        Ok(Self::new(
            store.clone(),
            store,
            Arc::new(gateway),
            catalog,
            vat,
            Arc::new(vies),
            WebhookVerifier::new(&config.gateway.public_key, &config.gateway.private_key),
            config.delivery_policy(),
        ))
    }

    pub fn new(
        store: Arc<dyn BillingStore>,
        queue: Arc<dyn WebhookQueue>,
        gateway: Arc<dyn PaymentGateway>,
        catalog: PlanCatalog,
        vat: VatTable,
        vat_id_verifier: Arc<dyn VatIdVerifier>,
        webhook_verifier: WebhookVerifier,
        policy: Arc<dyn DeliveryPolicy>,
    ) -> Self {
        let catalog = Arc::new(catalog);
        let vat = Arc::new(vat);
        let stats = Arc::new(ReconciliationStats::new());

        let subscriptions = SubscriptionService::new(
            store.clone(),
            gateway.clone(),
            catalog,
            vat.clone(),
            vat_id_verifier,
        );
        let ledger = LedgerService::new(store, vat);
        let webhooks = WebhookHandler::new(
            webhook_verifier.clone(),
            subscriptions.clone(),
            ledger.clone(),
            gateway,
        );
        let ingestor = WebhookIngestor::new(webhook_verifier, queue.clone(), policy.clone());
        let dispatcher =
            WebhookDispatcher::new(queue.clone(), webhooks.clone(), policy, stats.clone());

        Self {
            subscriptions,
            ledger,
            webhooks,
            ingestor,
            dispatcher,
            queue,
            stats,
        }
    }
}
