//! Company billing state

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::plans::FREE_PLAN_ID;

/// Lifecycle state of a company's subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionStatus {
    Pending,
    Active,
    #[serde(rename = "Past Due")]
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Pending => "Pending",
            SubscriptionStatus::Active => "Active",
            SubscriptionStatus::PastDue => "Past Due",
            SubscriptionStatus::Canceled => "Canceled",
        }
    }

    /// Map a gateway status string; an expired subscription is treated as canceled
    pub fn from_gateway(status: &str) -> Option<Self> {
        match status.trim() {
            "Pending" => Some(SubscriptionStatus::Pending),
            "Active" => Some(SubscriptionStatus::Active),
            "Past Due" => Some(SubscriptionStatus::PastDue),
            "Canceled" | "Expired" => Some(SubscriptionStatus::Canceled),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One tenant and the root of its billing state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Company {
    pub subdomain: String,
    pub name: String,
    pub subscription_plan_id: String,
    pub subscription_status: SubscriptionStatus,
    pub subscription_id: Option<String>,
    pub subscription_customer_id: Option<String>,
    #[serde(skip)]
    pub subscription_payment_token: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub subscription_valid_until: Option<OffsetDateTime>,
    pub subscription_country: String,
    pub subscription_vat_id: String,
    /// Optimistic concurrency token, bumped on every committed write
    #[serde(skip)]
    pub version: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Company {
    /// A company on the free plan, which never has gateway identifiers
    pub fn new_free(subdomain: &str, name: &str) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            subdomain: subdomain.to_string(),
            name: name.to_string(),
            subscription_plan_id: FREE_PLAN_ID.to_string(),
            subscription_status: SubscriptionStatus::Active,
            subscription_id: None,
            subscription_customer_id: None,
            subscription_payment_token: None,
            subscription_valid_until: None,
            subscription_country: String::new(),
            subscription_vat_id: String::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_free(&self) -> bool {
        self.subscription_plan_id == FREE_PLAN_ID
    }

    /// Grace period over while not in good standing
    pub fn is_suspended(&self, now: OffsetDateTime) -> bool {
        matches!(
            self.subscription_status,
            SubscriptionStatus::PastDue | SubscriptionStatus::Canceled
        ) && self
            .subscription_valid_until
            .is_some_and(|valid_until| valid_until < now)
    }
}
