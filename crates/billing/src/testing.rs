//! Test doubles shared by the unit and scenario tests

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;

use crate::company::{Company, SubscriptionStatus};
use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    CustomerDetails, GatewayCustomer, GatewaySubscription, GatewayTransaction, NewSubscription,
    PaymentGateway, PaymentMethod, SubscriptionUpdate,
};
use crate::ledger::LedgerService;
use crate::plans::{BillingCycle, Plan, PlanCatalog};
use crate::store::{BillingStore, InMemoryBillingStore};
use crate::subscriptions::SubscriptionService;
use crate::tax::{VatIdVerifier, VatTable};

/// How the fake gateway should misbehave
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayFailure {
    DeclineCard,
    RejectSubscription,
    Timeout,
}

#[derive(Default)]
struct FakeGatewayState {
    next_id: u32,
    subscriptions: HashMap<String, GatewaySubscription>,
    created: Vec<NewSubscription>,
    updates: Vec<(String, SubscriptionUpdate)>,
    canceled: Vec<String>,
    customers: Vec<String>,
    failure: Option<GatewayFailure>,
    transient_lookups: u32,
    lookups: u32,
}

/// Recording in-process gateway
#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<FakeGatewayState>,
}

/// `YYYY-MM-DD` a number of days from today
pub fn gateway_date(days_from_now: i64) -> String {
    let date = (OffsetDateTime::now_utc() + Duration::days(days_from_now)).date();
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_with(&self, failure: Option<GatewayFailure>) {
        self.state.lock().await.failure = failure;
    }

    /// The next `count` lookups time out
    pub async fn fail_lookups(&self, count: u32) {
        self.state.lock().await.transient_lookups = count;
    }

    pub async fn created(&self) -> Vec<NewSubscription> {
        self.state.lock().await.created.clone()
    }

    pub async fn updates(&self) -> Vec<(String, SubscriptionUpdate)> {
        self.state.lock().await.updates.clone()
    }

    pub async fn canceled(&self) -> Vec<String> {
        self.state.lock().await.canceled.clone()
    }

    pub async fn customers(&self) -> Vec<String> {
        self.state.lock().await.customers.clone()
    }

    pub async fn lookups(&self) -> u32 {
        self.state.lock().await.lookups
    }

    /// Record a charge against a subscription, as the gateway would on renewal
    pub async fn charge(&self, subscription_id: &str, transaction_id: &str, amount: &str, status: &str) {
        let now = OffsetDateTime::now_utc();
        let mut state = self.state.lock().await;
        if let Some(subscription) = state.subscriptions.get_mut(subscription_id) {
            subscription.transactions.retain(|t| t.id != transaction_id);
            subscription.transactions.insert(
                0,
                GatewayTransaction {
                    id: transaction_id.to_string(),
                    kind: "sale".to_string(),
                    status: status.to_string(),
                    amount: amount.to_string(),
                    created_at: now,
                    updated_at: now,
                },
            );
        }
    }

    pub async fn set_status(&self, subscription_id: &str, status: &str) {
        if let Some(subscription) = self.state.lock().await.subscriptions.get_mut(subscription_id) {
            subscription.status = status.to_string();
        }
    }

    pub async fn snapshot(&self, subscription_id: &str) -> Option<GatewaySubscription> {
        self.state
            .lock()
            .await
            .subscriptions
            .get(subscription_id)
            .cloned()
    }

    fn next_id(state: &mut FakeGatewayState, prefix: &str) -> String {
        state.next_id += 1;
        format!("{}_{}", prefix, state.next_id)
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_customer(&self, _customer: &CustomerDetails) -> BillingResult<GatewayCustomer> {
        let mut state = self.state.lock().await;
        let id = Self::next_id(&mut state, "cus");
        state.customers.push(id.clone());
        Ok(GatewayCustomer { id })
    }

    async fn create_payment_method(
        &self,
        customer_id: &str,
        _nonce: &str,
    ) -> BillingResult<PaymentMethod> {
        let mut state = self.state.lock().await;
        if state.failure == Some(GatewayFailure::DeclineCard) {
            return Err(BillingError::Gateway("Do Not Honor".to_string()));
        }
        Ok(PaymentMethod {
            token: Self::next_id(&mut state, "tok"),
            customer_id: customer_id.to_string(),
        })
    }

    async fn create_subscription(
        &self,
        request: &NewSubscription,
    ) -> BillingResult<GatewaySubscription> {
        let mut state = self.state.lock().await;
        match state.failure {
            Some(GatewayFailure::RejectSubscription) => {
                return Err(BillingError::Gateway("Plan is invalid".to_string()))
            }
            Some(GatewayFailure::Timeout) => {
                return Err(BillingError::GatewayTransient("timed out".to_string()))
            }
            _ => {}
        }

        let subscription = GatewaySubscription {
            id: Self::next_id(&mut state, "sub"),
            plan_id: request.plan_id.clone(),
            status: "Active".to_string(),
            billing_period_end_date: Some(gateway_date(30)),
            transactions: vec![],
        };
        state.created.push(request.clone());
        state
            .subscriptions
            .insert(subscription.id.clone(), subscription.clone());
        Ok(subscription)
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        update: &SubscriptionUpdate,
    ) -> BillingResult<GatewaySubscription> {
        let mut state = self.state.lock().await;
        if state.failure == Some(GatewayFailure::Timeout) {
            return Err(BillingError::GatewayTransient("timed out".to_string()));
        }
        state
            .updates
            .push((subscription_id.to_string(), update.clone()));
        let subscription = state
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| BillingError::NotFound(subscription_id.to_string()))?;
        subscription.plan_id = update.plan_id.clone();
        Ok(subscription.clone())
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<GatewaySubscription> {
        let mut state = self.state.lock().await;
        state.canceled.push(subscription_id.to_string());
        let subscription = state
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| BillingError::NotFound(subscription_id.to_string()))?;
        subscription.status = "Canceled".to_string();
        Ok(subscription.clone())
    }

    async fn find_subscription(&self, subscription_id: &str) -> BillingResult<GatewaySubscription> {
        let mut state = self.state.lock().await;
        state.lookups += 1;
        if state.transient_lookups > 0 {
            state.transient_lookups -= 1;
            return Err(BillingError::GatewayTransient("timed out".to_string()));
        }
        state
            .subscriptions
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(subscription_id.to_string()))
    }
}

/// Verifier with a fixed set of registered VAT IDs
#[derive(Default)]
pub struct StaticVerifier {
    valid: HashSet<String>,
}

impl StaticVerifier {
    pub fn with(ids: &[&str]) -> Self {
        Self {
            valid: ids.iter().map(|id| id.to_string()).collect(),
        }
    }
}

#[async_trait]
impl VatIdVerifier for StaticVerifier {
    async fn verify(&self, vat_id: &str) -> bool {
        self.valid.contains(vat_id)
    }
}

pub fn plan(id: &str, cycle: BillingCycle, price: i64, members: u32) -> Plan {
    Plan {
        id: id.to_string(),
        label: id.to_string(),
        price,
        monthly_price: None,
        cycle,
        members,
    }
}

pub fn catalog() -> PlanCatalog {
    PlanCatalog::new(vec![
        plan("free", BillingCycle::Monthly, 0, 3),
        plan("team-monthly", BillingCycle::Monthly, 1000, 10),
        plan("large-monthly", BillingCycle::Monthly, 3000, 50),
        plan("team-yearly", BillingCycle::Yearly, 10000, 10),
    ])
}

/// Services wired over in-memory collaborators
pub struct Harness {
    pub store: Arc<InMemoryBillingStore>,
    pub gateway: Arc<FakeGateway>,
    pub subscriptions: SubscriptionService,
    pub ledger: LedgerService,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_store(Arc::new(InMemoryBillingStore::new()))
    }

    pub fn with_store(store: Arc<InMemoryBillingStore>) -> Self {
        let gateway = Arc::new(FakeGateway::new());
        let vat = Arc::new(VatTable::eu_default());
        let subscriptions = SubscriptionService::new(
            store.clone(),
            gateway.clone(),
            Arc::new(catalog()),
            vat.clone(),
            Arc::new(StaticVerifier::with(&["DE146269081"])),
        );
        let ledger = LedgerService::new(store.clone(), vat);

        Self {
            store,
            gateway,
            subscriptions,
            ledger,
        }
    }

    pub async fn company(&self, subdomain: &str) -> Company {
        match self.store.get_company(subdomain).await {
            Ok(company) => company,
            Err(e) => panic!("company {} missing: {}", subdomain, e),
        }
    }

    pub async fn status(&self, subdomain: &str) -> SubscriptionStatus {
        self.company(subdomain).await.subscription_status
    }
}
