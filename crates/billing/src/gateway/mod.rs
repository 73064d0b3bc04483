//! Payment gateway contract
//!
//! The core only needs customer, payment method and subscription CRUD from the
//! gateway. Subscriptions come back with their billing period end as a
//! `YYYY-MM-DD` string and the transaction history attached.

mod client;

pub use client::{GatewayConfig, HttpGateway};

use std::str::FromStr;

use async_trait::async_trait;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{Date, OffsetDateTime};

use crate::company::SubscriptionStatus;
use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerDetails {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayCustomer {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentMethod {
    pub token: String,
    #[serde(default)]
    pub customer_id: String,
}

/// Request to start a new subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSubscription {
    pub plan_id: String,
    pub payment_method_token: String,
    /// Recurring VAT-inclusive price in minor units
    #[serde(serialize_with = "serialize_amount")]
    pub price: i64,
    /// One-off discount on the first billing cycle
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_optional_amount"
    )]
    pub first_cycle_discount: Option<i64>,
}

/// Request to move an existing subscription to another plan or price
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionUpdate {
    pub plan_id: String,
    #[serde(serialize_with = "serialize_amount")]
    pub price: i64,
    pub prorate_charges: bool,
    pub start_immediately: bool,
}

/// Subscription snapshot as reported by the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySubscription {
    pub id: String,
    #[serde(default)]
    pub plan_id: String,
    pub status: String,
    #[serde(default)]
    pub billing_period_end_date: Option<String>,
    #[serde(default)]
    pub transactions: Vec<GatewayTransaction>,
}

impl GatewaySubscription {
    pub fn status(&self) -> Option<SubscriptionStatus> {
        SubscriptionStatus::from_gateway(&self.status)
    }

    /// End of the current paid period; unparseable dates are logged and ignored
    pub fn billing_period_end(&self) -> Option<OffsetDateTime> {
        let raw = self.billing_period_end_date.as_deref()?;
        match parse_gateway_date(raw) {
            Ok(end) => Some(end),
            Err(e) => {
                tracing::warn!(
                    subscription_id = %self.id,
                    billing_period_end_date = %raw,
                    error = %e,
                    "Ignoring unparseable billing period end date"
                );
                None
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayTransaction {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    /// Decimal amount, e.g. `"11.90"`
    pub amount: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl GatewayTransaction {
    pub fn amount_minor_units(&self) -> BillingResult<i64> {
        parse_amount(&self.amount)
    }
}

/// External payment gateway
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_customer(&self, customer: &CustomerDetails) -> BillingResult<GatewayCustomer>;

    async fn create_payment_method(
        &self,
        customer_id: &str,
        nonce: &str,
    ) -> BillingResult<PaymentMethod>;

    async fn create_subscription(
        &self,
        request: &NewSubscription,
    ) -> BillingResult<GatewaySubscription>;

    async fn update_subscription(
        &self,
        subscription_id: &str,
        update: &SubscriptionUpdate,
    ) -> BillingResult<GatewaySubscription>;

    async fn cancel_subscription(&self, subscription_id: &str)
        -> BillingResult<GatewaySubscription>;

    async fn find_subscription(&self, subscription_id: &str) -> BillingResult<GatewaySubscription>;
}

/// Parse a `YYYY-MM-DD` gateway date as midnight UTC
pub fn parse_gateway_date(raw: &str) -> BillingResult<OffsetDateTime> {
    let date = Date::parse(raw.trim(), format_description!("[year]-[month]-[day]"))
        .map_err(|e| BillingError::InvalidInput(format!("Invalid gateway date '{}': {}", raw, e)))?;
    Ok(date.midnight().assume_utc())
}

/// Parse a gateway decimal amount into minor units, rounding half away from zero
pub fn parse_amount(raw: &str) -> BillingResult<i64> {
    let invalid = || BillingError::InvalidInput(format!("Invalid amount '{}'", raw));

    let mut amount = Decimal::from_str(raw.trim())
        .map_err(|_| invalid())?
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    amount.rescale(2);
    i64::try_from(amount.mantissa()).map_err(|_| invalid())
}

fn serialize_amount<S: serde::Serializer>(cents: &i64, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&Decimal::new(*cents, 2).to_string())
}

fn serialize_optional_amount<S: serde::Serializer>(
    cents: &Option<i64>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match cents {
        Some(cents) => serializer.serialize_str(&Decimal::new(*cents, 2).to_string()),
        None => serializer.serialize_none(),
    }
}
