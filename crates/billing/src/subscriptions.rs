//! Subscription lifecycle
//!
//! Every write to a company goes through [`SubscriptionService::with_company_transaction`],
//! which re-reads the record and commits conditionally on its version. User-driven
//! operations call the gateway first and only commit once it has confirmed; the
//! `mark_*` transitions are driven by webhooks and never call the gateway.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::company::{Company, SubscriptionStatus};
use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    CustomerDetails, GatewaySubscription, NewSubscription, PaymentGateway, SubscriptionUpdate,
};
use crate::plans::{Plan, PlanCatalog};
use crate::store::BillingStore;
use crate::tax::{effective_price, resubscribe_discount, sanitize_vat_id, VatIdVerifier, VatTable};

/// Attempts before a contended company write gives up
pub const MAX_TRANSACTION_ATTEMPTS: u32 = 5;

/// Payment details for starting a paid subscription
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    pub plan_id: String,
    pub payment_nonce: String,
    pub country: String,
    #[serde(default)]
    pub vat_id: String,
    #[serde(default)]
    pub customer: CustomerDetails,
}

/// A new tenant signing up
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignUp {
    pub subdomain: String,
    pub company_name: String,
    #[serde(flatten)]
    pub subscription: SubscribeRequest,
}

/// Billing overview shown to a company's owner
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSummary {
    pub need_vat: bool,
    pub vat: u32,
    pub vat_id: String,
    pub plans: Vec<Plan>,
    pub plan_id: String,
    pub status: SubscriptionStatus,
    /// Only reported once the first charge went through
    #[serde(with = "time::serde::rfc3339::option")]
    pub valid_until: Option<OffsetDateTime>,
}

struct OpenedSubscription {
    customer_id: String,
    payment_token: String,
    subscription: GatewaySubscription,
}

/// Subscription state machine over the company record
#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
    catalog: Arc<PlanCatalog>,
    vat: Arc<VatTable>,
    verifier: Arc<dyn VatIdVerifier>,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        catalog: Arc<PlanCatalog>,
        vat: Arc<VatTable>,
        verifier: Arc<dyn VatIdVerifier>,
    ) -> Self {
        Self {
            store,
            gateway,
            catalog,
            vat,
            verifier,
        }
    }

    /// Read-modify-write of one company, committed only if nobody wrote in between
    ///
    /// `apply` returns whether it changed anything; unchanged records are not
    /// written. Gives up with `Conflict` after [`MAX_TRANSACTION_ATTEMPTS`] lost races.
    pub async fn with_company_transaction<F>(
        &self,
        subdomain: &str,
        mut apply: F,
    ) -> BillingResult<Company>
    where
        F: FnMut(&mut Company) -> BillingResult<bool> + Send,
    {
        for attempt in 1..=MAX_TRANSACTION_ATTEMPTS {
            let current = self.store.get_company(subdomain).await?;
            let mut updated = current.clone();

            if !apply(&mut updated)? {
                return Ok(current);
            }

            updated.version = current.version + 1;
            updated.updated_at = OffsetDateTime::now_utc();
            if self
                .store
                .update_company_if_version(&updated, current.version)
                .await?
            {
                return Ok(updated);
            }

            tracing::debug!(
                subdomain = %subdomain,
                attempt = attempt,
                "Company changed concurrently, retrying transaction"
            );
        }

        tracing::warn!(
            subdomain = %subdomain,
            attempts = MAX_TRANSACTION_ATTEMPTS,
            "Giving up on contended company transaction"
        );
        Err(BillingError::Conflict(subdomain.to_string()))
    }

    /// Create a company on the free plan
    pub async fn register_free(&self, subdomain: &str, name: &str) -> BillingResult<Company> {
        let company = Company::new_free(subdomain, name);
        self.store.insert_company(&company).await?;

        tracing::info!(subdomain = %subdomain, "Registered company on the free plan");
        Ok(company)
    }

    /// Create a company together with its paid subscription
    ///
    /// Free plans skip the gateway entirely. The company is only created once the
    /// gateway has confirmed the subscription.
    pub async fn sign_up(&self, request: &SignUp) -> BillingResult<Company> {
        let plan = self.catalog.lookup(&request.subscription.plan_id)?.clone();
        if plan.is_free() {
            return self
                .register_free(&request.subdomain, &request.company_name)
                .await;
        }

        match self.store.get_company(&request.subdomain).await {
            Ok(_) => return Err(BillingError::SubdomainTaken(request.subdomain.clone())),
            Err(BillingError::CompanyNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let (country, vat_id) = self.tax_inputs(&request.subscription).await?;
        let opened = self
            .open_subscription(&request.subdomain, &plan, &request.subscription, &country, &vat_id)
            .await?;

        let mut company = Company::new_free(&request.subdomain, &request.company_name);
        company.subscription_plan_id = plan.id.clone();
        company.subscription_status = SubscriptionStatus::Pending;
        company.subscription_id = Some(opened.subscription.id.clone());
        company.subscription_customer_id = Some(opened.customer_id.clone());
        company.subscription_payment_token = Some(opened.payment_token);
        company.subscription_country = country;
        company.subscription_vat_id = vat_id;

        if let Err(e) = self.store.insert_company(&company).await {
            tracing::warn!(
                subdomain = %request.subdomain,
                customer_id = %opened.customer_id,
                subscription_id = %opened.subscription.id,
                error = %e,
                "Company insert failed after gateway subscription was created"
            );
            return Err(e);
        }

        tracing::info!(
            subdomain = %company.subdomain,
            plan_id = %plan.id,
            subscription_id = %opened.subscription.id,
            "Signed up company with pending subscription"
        );
        Ok(company)
    }

    /// Start a paid subscription for an existing company without one
    pub async fn subscribe(
        &self,
        subdomain: &str,
        request: &SubscribeRequest,
    ) -> BillingResult<Company> {
        let plan = self.catalog.lookup(&request.plan_id)?.clone();
        if plan.is_free() {
            return Err(BillingError::InvalidPlan(format!(
                "{} does not need a subscription",
                plan.id
            )));
        }

        let company = self.store.get_company(subdomain).await?;
        if company.subscription_id.is_some() {
            return Err(BillingError::InvalidState(format!(
                "{} already has a gateway subscription",
                subdomain
            )));
        }
        let team_size = self.store.team_size(subdomain).await?;
        if plan.members < team_size {
            return Err(BillingError::InvalidPlan(format!(
                "{} allows {} members, team has {}",
                plan.id, plan.members, team_size
            )));
        }

        let (country, vat_id) = self.tax_inputs(request).await?;
        let opened = self
            .open_subscription(subdomain, &plan, request, &country, &vat_id)
            .await?;

        let subscription_id = opened.subscription.id.clone();
        let result = self
            .with_company_transaction(subdomain, |company| {
                if company.subscription_id.is_some() {
                    return Err(BillingError::InvalidState(format!(
                        "{} was subscribed concurrently",
                        company.subdomain
                    )));
                }
                company.subscription_plan_id = plan.id.clone();
                company.subscription_status = SubscriptionStatus::Pending;
                company.subscription_id = Some(subscription_id.clone());
                company.subscription_customer_id = Some(opened.customer_id.clone());
                company.subscription_payment_token = Some(opened.payment_token.clone());
                company.subscription_valid_until = None;
                company.subscription_country = country.clone();
                company.subscription_vat_id = vat_id.clone();
                Ok(true)
            })
            .await;

        match &result {
            Ok(_) => tracing::info!(
                subdomain = %subdomain,
                plan_id = %plan.id,
                subscription_id = %subscription_id,
                "Subscribed company, awaiting first charge"
            ),
            Err(e) => tracing::warn!(
                subdomain = %subdomain,
                customer_id = %opened.customer_id,
                subscription_id = %subscription_id,
                error = %e,
                "Failed to commit subscription created at the gateway"
            ),
        }
        result
    }

    /// Move an active subscription to another eligible plan
    pub async fn change_plan(&self, subdomain: &str, new_plan_id: &str) -> BillingResult<Company> {
        let company = self.store.get_company(subdomain).await?;
        if company.subscription_status == SubscriptionStatus::Canceled {
            return Err(BillingError::InvalidState(format!(
                "{} is canceled, resubscribe instead",
                subdomain
            )));
        }

        let current = self.catalog.lookup(&company.subscription_plan_id)?;
        let team_size = self.store.team_size(subdomain).await?;
        let plan = self
            .catalog
            .valid_plans(current, team_size)
            .into_iter()
            .find(|plan| plan.id == new_plan_id)
            .cloned()
            .ok_or_else(|| {
                BillingError::InvalidPlan(format!(
                    "{} is not available for {} members on a {:?} cycle",
                    new_plan_id, team_size, current.cycle
                ))
            })?;

        self.apply_plan(company, &plan).await
    }

    /// Dispatch a plan change: canceled companies start over, others are updated
    pub async fn update_plan(&self, subdomain: &str, plan_id: &str) -> BillingResult<Company> {
        let company = self.store.get_company(subdomain).await?;
        if company.subscription_status == SubscriptionStatus::Canceled {
            self.resubscribe(subdomain, plan_id).await
        } else {
            self.change_plan(subdomain, plan_id).await
        }
    }

    /// Start a fresh subscription for a canceled company
    ///
    /// Unused days of the canceled period are credited against the first charge.
    pub async fn resubscribe(&self, subdomain: &str, new_plan_id: &str) -> BillingResult<Company> {
        let company = self.store.get_company(subdomain).await?;
        if company.subscription_status != SubscriptionStatus::Canceled {
            return Err(BillingError::InvalidState(format!(
                "{} is {}, only canceled subscriptions can be restarted",
                subdomain, company.subscription_status
            )));
        }
        let payment_token = company.subscription_payment_token.clone().ok_or_else(|| {
            BillingError::InvalidState(format!("{} has no payment method on file", subdomain))
        })?;

        let previous = self.catalog.lookup(&company.subscription_plan_id)?;
        let team_size = self.store.team_size(subdomain).await?;
        let plan = self
            .catalog
            .valid_plans(previous, team_size)
            .into_iter()
            .find(|plan| plan.id == new_plan_id)
            .cloned()
            .ok_or_else(|| BillingError::InvalidPlan(new_plan_id.to_string()))?;

        let now = OffsetDateTime::now_utc();
        let discount = company
            .subscription_valid_until
            .map(|valid_until| resubscribe_discount(previous, valid_until, now))
            .unwrap_or(0);
        let vat = self.vat_percent(&company);
        let price = effective_price(plan.price, vat);
        let first_charge = effective_price((plan.price - discount).max(0), vat);
        let first_cycle_discount = (price > first_charge).then_some(price - first_charge);

        let subscription = self
            .gateway
            .create_subscription(&NewSubscription {
                plan_id: plan.id.clone(),
                payment_method_token: payment_token,
                price,
                first_cycle_discount,
            })
            .await?;
        let valid_until = subscription.billing_period_end();

        let updated = self
            .with_company_transaction(subdomain, |company| {
                if company.subscription_status != SubscriptionStatus::Canceled {
                    return Err(BillingError::InvalidState(format!(
                        "{} changed while resubscribing",
                        company.subdomain
                    )));
                }
                company.subscription_plan_id = plan.id.clone();
                company.subscription_status = SubscriptionStatus::Pending;
                company.subscription_id = Some(subscription.id.clone());
                if valid_until.is_some() {
                    company.subscription_valid_until = valid_until;
                }
                Ok(true)
            })
            .await?;

        tracing::info!(
            subdomain = %subdomain,
            plan_id = %plan.id,
            subscription_id = %subscription.id,
            discount = discount,
            first_charge = first_charge,
            "Resubscribed canceled company"
        );
        Ok(updated)
    }

    /// Cancel at the gateway; access continues until the paid period ends
    pub async fn cancel(&self, subdomain: &str) -> BillingResult<Company> {
        let company = self.store.get_company(subdomain).await?;
        if company.subscription_status == SubscriptionStatus::Canceled {
            return Err(BillingError::InvalidState(format!(
                "{} is already canceled",
                subdomain
            )));
        }
        let subscription_id = company.subscription_id.clone().ok_or_else(|| {
            BillingError::InvalidState(format!("{} has no subscription to cancel", subdomain))
        })?;

        let subscription = self.gateway.cancel_subscription(&subscription_id).await?;
        let updated = self.commit_canceled(subdomain, &subscription).await?;

        tracing::info!(
            subdomain = %subdomain,
            subscription_id = %subscription_id,
            "Canceled subscription"
        );
        Ok(updated)
    }

    /// Store a new VAT ID and re-price the subscription
    pub async fn update_vat_id(&self, subdomain: &str, vat_id: &str) -> BillingResult<Company> {
        let vat_id = sanitize_vat_id(vat_id);
        if !vat_id.is_empty() && !self.verifier.verify(&vat_id).await {
            return Err(BillingError::InvalidInput(format!(
                "VAT ID {} is not valid",
                vat_id
            )));
        }

        let company = self
            .with_company_transaction(subdomain, |company| {
                if company.subscription_vat_id == vat_id {
                    return Ok(false);
                }
                company.subscription_vat_id = vat_id.clone();
                Ok(true)
            })
            .await?;

        if company.is_free()
            || company.subscription_id.is_none()
            || company.subscription_status == SubscriptionStatus::Canceled
        {
            return Ok(company);
        }

        let plan = self.catalog.lookup(&company.subscription_plan_id)?.clone();
        self.apply_plan(company, &plan).await
    }

    pub async fn current_subscription(&self, subdomain: &str) -> BillingResult<SubscriptionSummary> {
        let company = self.store.get_company(subdomain).await?;
        let vat = self.vat.lookup(&company.subscription_country);
        let team_size = self.store.team_size(subdomain).await?;
        let plans = match self.catalog.lookup(&company.subscription_plan_id) {
            Ok(current) => self
                .catalog
                .valid_plans(current, team_size)
                .into_iter()
                .cloned()
                .collect(),
            Err(_) => {
                tracing::warn!(
                    subdomain = %subdomain,
                    plan_id = %company.subscription_plan_id,
                    "Company is on a plan missing from the catalog"
                );
                Vec::new()
            }
        };

        let valid_until = match company.subscription_status {
            SubscriptionStatus::Pending => None,
            _ => company.subscription_valid_until,
        };

        Ok(SubscriptionSummary {
            need_vat: vat != 0 && company.subscription_vat_id.is_empty(),
            vat,
            vat_id: company.subscription_vat_id,
            plans,
            plan_id: company.subscription_plan_id,
            status: company.subscription_status,
            valid_until,
        })
    }

    /// Resolve the company owning a gateway subscription
    pub async fn find_by_subscription_id(&self, subscription_id: &str) -> BillingResult<Company> {
        self.store
            .find_company_by_subscription(subscription_id)
            .await?
            .ok_or_else(|| BillingError::SubscriptionNotMapped(subscription_id.to_string()))
    }

    pub async fn mark_canceled(
        &self,
        subdomain: &str,
        subscription: &GatewaySubscription,
    ) -> BillingResult<Company> {
        self.commit_canceled(subdomain, subscription).await
    }

    pub async fn mark_past_due(
        &self,
        subdomain: &str,
        subscription: &GatewaySubscription,
    ) -> BillingResult<Company> {
        self.commit_webhook_status(subdomain, subscription, SubscriptionStatus::PastDue)
            .await
    }

    pub async fn mark_active(
        &self,
        subdomain: &str,
        subscription: &GatewaySubscription,
    ) -> BillingResult<Company> {
        self.commit_webhook_status(subdomain, subscription, SubscriptionStatus::Active)
            .await
    }

    fn vat_percent(&self, company: &Company) -> u32 {
        self.vat
            .percent_for(&company.subscription_country, &company.subscription_vat_id)
    }

    async fn tax_inputs(&self, request: &SubscribeRequest) -> BillingResult<(String, String)> {
        let country = request.country.trim().to_ascii_uppercase();
        let vat_id = sanitize_vat_id(&request.vat_id);
        if !vat_id.is_empty() && !self.verifier.verify(&vat_id).await {
            return Err(BillingError::InvalidInput(format!(
                "VAT ID {} is not valid",
                vat_id
            )));
        }
        Ok((country, vat_id))
    }

    /// Customer, card and subscription at the gateway, in that order
    ///
    /// A failure after the customer exists leaves it orphaned at the gateway.
    async fn open_subscription(
        &self,
        subdomain: &str,
        plan: &Plan,
        request: &SubscribeRequest,
        country: &str,
        vat_id: &str,
    ) -> BillingResult<OpenedSubscription> {
        let vat = self.vat.percent_for(country, vat_id);
        let price = effective_price(plan.price, vat);

        let customer = self.gateway.create_customer(&request.customer).await?;

        let payment_method = match self
            .gateway
            .create_payment_method(&customer.id, &request.payment_nonce)
            .await
        {
            Ok(payment_method) => payment_method,
            Err(e) => {
                tracing::warn!(
                    subdomain = %subdomain,
                    customer_id = %customer.id,
                    error = %e,
                    "Payment method rejected, gateway customer left orphaned"
                );
                return Err(e);
            }
        };

        let subscription = match self
            .gateway
            .create_subscription(&NewSubscription {
                plan_id: plan.id.clone(),
                payment_method_token: payment_method.token.clone(),
                price,
                first_cycle_discount: None,
            })
            .await
        {
            Ok(subscription) => subscription,
            Err(e) => {
                tracing::warn!(
                    subdomain = %subdomain,
                    customer_id = %customer.id,
                    error = %e,
                    "Subscription creation failed, gateway customer left orphaned"
                );
                return Err(e);
            }
        };

        tracing::debug!(
            subdomain = %subdomain,
            plan_id = %plan.id,
            vat = vat,
            price = price,
            "Created gateway subscription"
        );
        Ok(OpenedSubscription {
            customer_id: customer.id,
            payment_token: payment_method.token,
            subscription,
        })
    }

    /// Push the plan and current VAT-inclusive price to the gateway, then commit
    async fn apply_plan(&self, company: Company, plan: &Plan) -> BillingResult<Company> {
        let subscription_id = company.subscription_id.clone().ok_or_else(|| {
            BillingError::InvalidState(format!("{} has no subscription", company.subdomain))
        })?;
        let price = effective_price(plan.price, self.vat_percent(&company));

        let subscription = self
            .gateway
            .update_subscription(
                &subscription_id,
                &SubscriptionUpdate {
                    plan_id: plan.id.clone(),
                    price,
                    prorate_charges: true,
                    start_immediately: true,
                },
            )
            .await?;

        let status = subscription.status();
        if status.is_none() {
            tracing::warn!(
                subdomain = %company.subdomain,
                subscription_id = %subscription_id,
                status = %subscription.status,
                "Gateway reported an unknown subscription status, keeping the current one"
            );
        }
        let valid_until = subscription.billing_period_end();

        let updated = self
            .with_company_transaction(&company.subdomain, |company| {
                company.subscription_plan_id = plan.id.clone();
                if let Some(status) = status {
                    company.subscription_status = status;
                    if matches!(status, SubscriptionStatus::PastDue | SubscriptionStatus::Canceled)
                        && valid_until.is_some()
                    {
                        company.subscription_valid_until = valid_until;
                    }
                }
                Ok(true)
            })
            .await?;

        tracing::info!(
            subdomain = %updated.subdomain,
            plan_id = %plan.id,
            price = price,
            status = %updated.subscription_status,
            "Updated subscription plan"
        );
        Ok(updated)
    }

    async fn commit_canceled(
        &self,
        subdomain: &str,
        subscription: &GatewaySubscription,
    ) -> BillingResult<Company> {
        let valid_until = subscription.billing_period_end();

        self.with_company_transaction(subdomain, |company| {
            if company.subscription_id.as_deref() != Some(subscription.id.as_str()) {
                tracing::info!(
                    subdomain = %company.subdomain,
                    subscription_id = %subscription.id,
                    "Ignoring cancellation of a superseded subscription"
                );
                return Ok(false);
            }

            let valid_until = valid_until.or(company.subscription_valid_until);
            if company.subscription_status == SubscriptionStatus::Canceled
                && company.subscription_valid_until == valid_until
            {
                return Ok(false);
            }
            company.subscription_status = SubscriptionStatus::Canceled;
            company.subscription_valid_until = valid_until;
            Ok(true)
        })
        .await
    }

    async fn commit_webhook_status(
        &self,
        subdomain: &str,
        subscription: &GatewaySubscription,
        status: SubscriptionStatus,
    ) -> BillingResult<Company> {
        let valid_until = subscription.billing_period_end();

        self.with_company_transaction(subdomain, |company| {
            if company.subscription_id.as_deref() != Some(subscription.id.as_str()) {
                tracing::info!(
                    subdomain = %company.subdomain,
                    subscription_id = %subscription.id,
                    status = %status,
                    "Ignoring status change for a superseded subscription"
                );
                return Ok(false);
            }
            // A canceled subscription id never comes back
            if company.subscription_status == SubscriptionStatus::Canceled {
                tracing::info!(
                    subdomain = %company.subdomain,
                    subscription_id = %subscription.id,
                    status = %status,
                    "Ignoring status change for a canceled subscription"
                );
                return Ok(false);
            }

            let valid_until = valid_until.or(company.subscription_valid_until);
            if company.subscription_status == status
                && company.subscription_valid_until == valid_until
            {
                return Ok(false);
            }
            company.subscription_status = status;
            company.subscription_valid_until = valid_until;
            Ok(true)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryBillingStore;
    use crate::testing::{gateway_date, GatewayFailure, Harness};
    use async_trait::async_trait;

    fn request(plan_id: &str, country: &str, vat_id: &str) -> SubscribeRequest {
        SubscribeRequest {
            plan_id: plan_id.to_string(),
            payment_nonce: "fake-valid-nonce".to_string(),
            country: country.to_string(),
            vat_id: vat_id.to_string(),
            customer: CustomerDetails {
                first_name: "Peter".to_string(),
                last_name: "Parker".to_string(),
                email: "peter@example.com".to_string(),
            },
        }
    }

    fn sign_up(subdomain: &str, plan_id: &str, country: &str) -> SignUp {
        SignUp {
            subdomain: subdomain.to_string(),
            company_name: "Acme".to_string(),
            subscription: request(plan_id, country, ""),
        }
    }

    fn snapshot(id: &str, status: &str, end: Option<String>) -> GatewaySubscription {
        GatewaySubscription {
            id: id.to_string(),
            plan_id: "team-monthly".to_string(),
            status: status.to_string(),
            billing_period_end_date: end,
            transactions: vec![],
        }
    }

    // =========================================================================
    // Sign-up and subscribe
    // =========================================================================

    #[tokio::test]
    async fn test_sign_up_charges_vat_inclusive_price() {
        let h = Harness::new();
        let company = h
            .subscriptions
            .sign_up(&sign_up("acme", "team-monthly", "de"))
            .await
            .unwrap();

        assert_eq!(company.subscription_status, SubscriptionStatus::Pending);
        assert_eq!(company.subscription_country, "DE");
        assert!(company.subscription_id.is_some());
        assert!(company.subscription_customer_id.is_some());

        let created = h.gateway.created().await;
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].price, 1190);
    }

    #[tokio::test]
    async fn test_sign_up_with_vat_id_charges_no_vat() {
        let h = Harness::new();
        let mut request = sign_up("acme", "team-monthly", "DE");
        request.subscription.vat_id = "DE 146269081".to_string();

        let company = h.subscriptions.sign_up(&request).await.unwrap();
        assert_eq!(company.subscription_vat_id, "DE146269081");
        assert_eq!(h.gateway.created().await[0].price, 1000);
    }

    #[tokio::test]
    async fn test_sign_up_rejects_unverified_vat_id() {
        let h = Harness::new();
        let mut request = sign_up("acme", "team-monthly", "DE");
        request.subscription.vat_id = "DE000000000".to_string();

        let result = h.subscriptions.sign_up(&request).await;
        assert!(matches!(result, Err(BillingError::InvalidInput(_))));
        assert!(h.gateway.customers().await.is_empty());
    }

    #[tokio::test]
    async fn test_declined_card_commits_nothing() {
        let h = Harness::new();
        h.gateway.fail_with(Some(GatewayFailure::DeclineCard)).await;

        let result = h
            .subscriptions
            .sign_up(&sign_up("acme", "team-monthly", "DE"))
            .await;

        assert!(matches!(result, Err(BillingError::Gateway(_))));
        assert!(matches!(
            h.store.get_company("acme").await,
            Err(BillingError::CompanyNotFound(_))
        ));
        // The customer stays behind at the gateway
        assert_eq!(h.gateway.customers().await.len(), 1);
    }

    #[tokio::test]
    async fn test_gateway_timeout_leaves_free_company_untouched() {
        let h = Harness::new();
        h.subscriptions.register_free("acme", "Acme").await.unwrap();
        h.gateway.fail_with(Some(GatewayFailure::Timeout)).await;

        let result = h
            .subscriptions
            .subscribe("acme", &request("team-monthly", "DE", ""))
            .await;

        assert!(result.unwrap_err().is_transient());
        let company = h.company("acme").await;
        assert!(company.is_free());
        assert_eq!(company.subscription_status, SubscriptionStatus::Active);
        assert!(company.subscription_id.is_none());
        assert_eq!(company.version, 0);
    }

    #[tokio::test]
    async fn test_free_company_upgrades_via_subscribe() {
        let h = Harness::new();
        h.subscriptions.register_free("acme", "Acme").await.unwrap();

        let company = h
            .subscriptions
            .subscribe("acme", &request("team-monthly", "US", ""))
            .await
            .unwrap();

        assert_eq!(company.subscription_plan_id, "team-monthly");
        assert_eq!(company.subscription_status, SubscriptionStatus::Pending);
        assert_eq!(h.gateway.created().await[0].price, 1000);
    }

    #[tokio::test]
    async fn test_sign_up_on_free_plan_skips_gateway() {
        let h = Harness::new();
        let company = h
            .subscriptions
            .sign_up(&sign_up("acme", "free", "DE"))
            .await
            .unwrap();

        assert!(company.is_free());
        assert!(h.gateway.customers().await.is_empty());
    }

    #[tokio::test]
    async fn test_sign_up_taken_subdomain() {
        let h = Harness::new();
        h.subscriptions.register_free("acme", "Acme").await.unwrap();

        let result = h
            .subscriptions
            .sign_up(&sign_up("acme", "team-monthly", "DE"))
            .await;
        assert!(matches!(result, Err(BillingError::SubdomainTaken(_))));
        assert!(h.gateway.customers().await.is_empty());
    }

    // =========================================================================
    // Plan changes
    // =========================================================================

    #[tokio::test]
    async fn test_change_plan_prorates_immediately() {
        let h = Harness::new();
        h.subscriptions
            .sign_up(&sign_up("acme", "team-monthly", "DE"))
            .await
            .unwrap();

        let company = h
            .subscriptions
            .change_plan("acme", "large-monthly")
            .await
            .unwrap();

        assert_eq!(company.subscription_plan_id, "large-monthly");
        // Status comes from the gateway response
        assert_eq!(company.subscription_status, SubscriptionStatus::Active);

        let updates = h.gateway.updates().await;
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].1.price, 3570);
        assert!(updates[0].1.prorate_charges);
        assert!(updates[0].1.start_immediately);
    }

    #[tokio::test]
    async fn test_change_plan_rejects_ineligible_plans() {
        let h = Harness::new();
        h.subscriptions
            .sign_up(&sign_up("acme", "large-monthly", "DE"))
            .await
            .unwrap();
        h.store.set_team_size("acme", 12).await;

        for plan_id in ["team-monthly", "team-yearly", "free", "unknown"] {
            let result = h.subscriptions.change_plan("acme", plan_id).await;
            assert!(
                matches!(result, Err(BillingError::InvalidPlan(_))),
                "{} should be rejected",
                plan_id
            );
        }
        assert!(h.gateway.updates().await.is_empty());
        assert_eq!(h.company("acme").await.subscription_plan_id, "large-monthly");
    }

    #[tokio::test]
    async fn test_update_vat_id_reprices_current_plan() {
        let h = Harness::new();
        h.subscriptions
            .sign_up(&sign_up("acme", "team-monthly", "DE"))
            .await
            .unwrap();

        let company = h
            .subscriptions
            .update_vat_id("acme", "DE146269081")
            .await
            .unwrap();

        assert_eq!(company.subscription_vat_id, "DE146269081");
        let updates = h.gateway.updates().await;
        assert_eq!(updates[0].1.plan_id, "team-monthly");
        assert_eq!(updates[0].1.price, 1000);
    }

    #[tokio::test]
    async fn test_update_vat_id_rejects_invalid_id() {
        let h = Harness::new();
        h.subscriptions.register_free("acme", "Acme").await.unwrap();

        let result = h.subscriptions.update_vat_id("acme", "RO1").await;
        assert!(matches!(result, Err(BillingError::InvalidInput(_))));
        assert_eq!(h.company("acme").await.subscription_vat_id, "");
    }

    #[tokio::test]
    async fn test_update_vat_id_on_free_plan_does_not_touch_gateway() {
        let h = Harness::new();
        h.subscriptions.register_free("acme", "Acme").await.unwrap();

        let company = h
            .subscriptions
            .update_vat_id("acme", "DE146269081")
            .await
            .unwrap();
        assert_eq!(company.subscription_vat_id, "DE146269081");
        assert!(h.gateway.updates().await.is_empty());
    }

    // =========================================================================
    // Cancel and resubscribe
    // =========================================================================

    #[tokio::test]
    async fn test_cancel_keeps_access_until_period_end() {
        let h = Harness::new();
        let company = h
            .subscriptions
            .sign_up(&sign_up("acme", "team-monthly", "DE"))
            .await
            .unwrap();

        let canceled = h.subscriptions.cancel("acme").await.unwrap();
        assert_eq!(canceled.subscription_status, SubscriptionStatus::Canceled);

        let valid_until = canceled.subscription_valid_until.unwrap();
        assert!(valid_until > OffsetDateTime::now_utc() + time::Duration::days(28));
        assert!(!canceled.is_suspended(OffsetDateTime::now_utc()));
        assert_eq!(h.gateway.canceled().await, vec![company.subscription_id.unwrap()]);

        assert!(matches!(
            h.subscriptions.cancel("acme").await,
            Err(BillingError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_resubscribe_credits_unused_days() {
        let h = Harness::new();
        let first = h
            .subscriptions
            .sign_up(&sign_up("acme", "team-monthly", "DE"))
            .await
            .unwrap();
        h.subscriptions.cancel("acme").await.unwrap();

        let company = h.subscriptions.resubscribe("acme", "large-monthly").await.unwrap();

        assert_eq!(company.subscription_status, SubscriptionStatus::Pending);
        assert_eq!(company.subscription_plan_id, "large-monthly");
        assert_ne!(company.subscription_id, first.subscription_id);

        let created = h.gateway.created().await;
        assert_eq!(created.len(), 2);
        let request = &created[1];
        assert_eq!(request.price, 3570);

        // 29 or 30 whole days left at 1000 / 30 = 33 per day
        let discount = 3000 - (request.price - request.first_cycle_discount.unwrap_or(0)) * 100 / 119;
        assert!(discount >= 29 * 33 - 1 && discount <= 30 * 33 + 1, "discount {}", discount);
    }

    #[tokio::test]
    async fn test_resubscribe_requires_canceled() {
        let h = Harness::new();
        h.subscriptions
            .sign_up(&sign_up("acme", "team-monthly", "DE"))
            .await
            .unwrap();

        assert!(matches!(
            h.subscriptions.resubscribe("acme", "team-monthly").await,
            Err(BillingError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_update_plan_dispatches_on_status() {
        let h = Harness::new();
        h.subscriptions
            .sign_up(&sign_up("acme", "team-monthly", "DE"))
            .await
            .unwrap();

        h.subscriptions
            .update_plan("acme", "large-monthly")
            .await
            .unwrap();
        assert_eq!(h.gateway.updates().await.len(), 1);

        h.subscriptions.cancel("acme").await.unwrap();
        h.subscriptions
            .update_plan("acme", "team-monthly")
            .await
            .unwrap();
        assert_eq!(h.gateway.created().await.len(), 2);
        assert_eq!(h.status("acme").await, SubscriptionStatus::Pending);
    }

    // =========================================================================
    // Webhook-driven transitions
    // =========================================================================

    #[tokio::test]
    async fn test_mark_past_due_uses_gateway_period_end() {
        let h = Harness::new();
        let company = h
            .subscriptions
            .sign_up(&sign_up("acme", "team-monthly", "DE"))
            .await
            .unwrap();
        let id = company.subscription_id.unwrap();

        let updated = h
            .subscriptions
            .mark_past_due("acme", &snapshot(&id, "Past Due", Some(gateway_date(-2))))
            .await
            .unwrap();

        assert_eq!(updated.subscription_status, SubscriptionStatus::PastDue);
        assert!(updated.is_suspended(OffsetDateTime::now_utc()));
    }

    #[tokio::test]
    async fn test_unparseable_period_end_keeps_valid_until() {
        let h = Harness::new();
        let company = h
            .subscriptions
            .sign_up(&sign_up("acme", "team-monthly", "DE"))
            .await
            .unwrap();
        let id = company.subscription_id.unwrap();

        h.subscriptions
            .mark_past_due("acme", &snapshot(&id, "Past Due", Some(gateway_date(3))))
            .await
            .unwrap();
        let before = h.company("acme").await.subscription_valid_until;

        let updated = h
            .subscriptions
            .mark_canceled("acme", &snapshot(&id, "Canceled", Some("03/31/2016".into())))
            .await
            .unwrap();
        assert_eq!(updated.subscription_status, SubscriptionStatus::Canceled);
        assert_eq!(updated.subscription_valid_until, before);
    }

    #[tokio::test]
    async fn test_canceled_is_terminal_for_webhooks() {
        let h = Harness::new();
        let company = h
            .subscriptions
            .sign_up(&sign_up("acme", "team-monthly", "DE"))
            .await
            .unwrap();
        let id = company.subscription_id.unwrap();
        h.subscriptions.cancel("acme").await.unwrap();

        let after = h
            .subscriptions
            .mark_active("acme", &snapshot(&id, "Active", Some(gateway_date(60))))
            .await
            .unwrap();
        assert_eq!(after.subscription_status, SubscriptionStatus::Canceled);
    }

    #[tokio::test]
    async fn test_stale_webhook_for_old_subscription_is_ignored() {
        let h = Harness::new();
        let first = h
            .subscriptions
            .sign_up(&sign_up("acme", "team-monthly", "DE"))
            .await
            .unwrap();
        h.subscriptions.cancel("acme").await.unwrap();
        h.subscriptions.resubscribe("acme", "team-monthly").await.unwrap();

        let old_id = first.subscription_id.unwrap();
        let after = h
            .subscriptions
            .mark_canceled("acme", &snapshot(&old_id, "Canceled", Some(gateway_date(1))))
            .await
            .unwrap();
        assert_eq!(after.subscription_status, SubscriptionStatus::Pending);
    }

    #[tokio::test]
    async fn test_find_by_subscription_id() {
        let h = Harness::new();
        let company = h
            .subscriptions
            .sign_up(&sign_up("acme", "team-monthly", "DE"))
            .await
            .unwrap();

        let found = h
            .subscriptions
            .find_by_subscription_id(company.subscription_id.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(found.subdomain, "acme");

        assert!(matches!(
            h.subscriptions.find_by_subscription_id("sub_missing").await,
            Err(BillingError::SubscriptionNotMapped(_))
        ));
    }

    #[tokio::test]
    async fn test_current_subscription_summary() {
        let h = Harness::new();
        h.subscriptions
            .sign_up(&sign_up("acme", "team-monthly", "DE"))
            .await
            .unwrap();

        let summary = h.subscriptions.current_subscription("acme").await.unwrap();
        assert!(summary.need_vat);
        assert_eq!(summary.vat, 19);
        assert_eq!(summary.status, SubscriptionStatus::Pending);
        assert!(summary.valid_until.is_none());
        let plans: Vec<&str> = summary.plans.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(plans, vec!["team-monthly", "large-monthly"]);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["needVat"], true);
        assert_eq!(json["planId"], "team-monthly");
    }

    // =========================================================================
    // Optimistic transactions
    // =========================================================================

    /// Store that lets another writer win the first `conflicts` conditional updates
    struct ContendedStore {
        inner: InMemoryBillingStore,
        conflicts: tokio::sync::Mutex<u32>,
    }

    #[async_trait]
    impl BillingStore for ContendedStore {
        async fn get_company(&self, subdomain: &str) -> BillingResult<Company> {
            self.inner.get_company(subdomain).await
        }

        async fn find_company_by_subscription(
            &self,
            subscription_id: &str,
        ) -> BillingResult<Option<Company>> {
            self.inner.find_company_by_subscription(subscription_id).await
        }

        async fn insert_company(&self, company: &Company) -> BillingResult<()> {
            self.inner.insert_company(company).await
        }

        async fn update_company_if_version(
            &self,
            company: &Company,
            expected_version: i64,
        ) -> BillingResult<bool> {
            let mut conflicts = self.conflicts.lock().await;
            if *conflicts > 0 {
                *conflicts -= 1;
                // A concurrent writer renames the company first
                let mut other = self.inner.get_company(&company.subdomain).await?;
                other.name = format!("{} (renamed)", other.name);
                other.version += 1;
                self.inner
                    .update_company_if_version(&other, expected_version)
                    .await?;
            }
            self.inner
                .update_company_if_version(company, expected_version)
                .await
        }

        async fn team_size(&self, subdomain: &str) -> BillingResult<u32> {
            self.inner.team_size(subdomain).await
        }

        async fn get_transaction(
            &self,
            subdomain: &str,
            transaction_id: &str,
        ) -> BillingResult<Option<crate::ledger::LedgerRecord>> {
            self.inner.get_transaction(subdomain, transaction_id).await
        }

        async fn upsert_transaction(
            &self,
            record: &crate::ledger::LedgerRecord,
        ) -> BillingResult<()> {
            self.inner.upsert_transaction(record).await
        }

        async fn list_invoices(
            &self,
            subdomain: &str,
        ) -> BillingResult<Vec<crate::ledger::LedgerRecord>> {
            self.inner.list_invoices(subdomain).await
        }
    }

    fn contended_service(conflicts: u32) -> (Arc<ContendedStore>, SubscriptionService) {
        let store = Arc::new(ContendedStore {
            inner: InMemoryBillingStore::new(),
            conflicts: tokio::sync::Mutex::new(conflicts),
        });
        let service = SubscriptionService::new(
            store.clone(),
            Arc::new(crate::testing::FakeGateway::new()),
            Arc::new(crate::testing::catalog()),
            Arc::new(VatTable::eu_default()),
            Arc::new(crate::testing::StaticVerifier::default()),
        );
        (store, service)
    }

    #[tokio::test]
    async fn test_transaction_retries_on_concurrent_write() {
        let (store, service) = contended_service(2);
        service.register_free("acme", "Acme").await.unwrap();

        let updated = service
            .with_company_transaction("acme", |company| {
                company.subscription_country = "DE".to_string();
                Ok(true)
            })
            .await
            .unwrap();

        // Both the concurrent renames and our change survive
        assert_eq!(updated.subscription_country, "DE");
        assert_eq!(updated.name, "Acme (renamed) (renamed)");
        assert_eq!(updated.version, 3);
        assert_eq!(store.get_company("acme").await.unwrap(), updated);
    }

    #[tokio::test]
    async fn test_transaction_gives_up_after_max_attempts() {
        let (_, service) = contended_service(MAX_TRANSACTION_ATTEMPTS);
        service.register_free("acme", "Acme").await.unwrap();

        let result = service
            .with_company_transaction("acme", |company| {
                company.subscription_country = "DE".to_string();
                Ok(true)
            })
            .await;
        assert!(matches!(result, Err(BillingError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_transaction_skips_write_when_unchanged() {
        let h = Harness::new();
        h.subscriptions.register_free("acme", "Acme").await.unwrap();

        let company = h
            .subscriptions
            .with_company_transaction("acme", |_| Ok(false))
            .await
            .unwrap();
        assert_eq!(company.version, 0);
    }
}
