//! Subscription plan catalog
//!
//! The catalog is loaded once at start-up and never reloaded. Plans are priced in
//! minor units (cents) before VAT.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};

/// Plan id that never touches the gateway
pub const FREE_PLAN_ID: &str = "free";

/// How often a plan renews
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingCycle {
    Monthly,
    Yearly,
}

impl BillingCycle {
    /// Days used when converting a plan price into a daily rate
    pub fn days(&self) -> i64 {
        match self {
            BillingCycle::Monthly => 30,
            BillingCycle::Yearly => 365,
        }
    }
}

/// Subscription plan configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: String,
    #[serde(default)]
    pub label: String,
    /// Base price per cycle, before VAT
    pub price: i64,
    /// Equivalent monthly price, shown for yearly plans
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monthly_price: Option<i64>,
    pub cycle: BillingCycle,
    /// Maximum team size
    pub members: u32,
}

impl Plan {
    pub fn is_free(&self) -> bool {
        self.id == FREE_PLAN_ID
    }
}

/// Format minor units as `$X.YY`
pub fn format_dollars(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.abs();
    format!("{}${}.{:02}", sign, cents / 100, cents % 100)
}

/// Immutable list of plans
#[derive(Debug, Clone, Default)]
pub struct PlanCatalog {
    plans: Vec<Plan>,
}

impl PlanCatalog {
    pub fn new(plans: Vec<Plan>) -> Self {
        Self { plans }
    }

    /// Load the catalog from a JSON array of plans
    pub fn from_json_file(path: impl AsRef<Path>) -> BillingResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BillingError::Config(format!("Failed to read plans from {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> BillingResult<Self> {
        let plans: Vec<Plan> = serde_json::from_str(raw)
            .map_err(|e| BillingError::Config(format!("Invalid plan catalog: {}", e)))?;

        if plans.is_empty() {
            return Err(BillingError::Config("Plan catalog is empty".to_string()));
        }

        tracing::info!(plans = plans.len(), "Loaded subscription plan catalog");
        Ok(Self::new(plans))
    }

    pub fn plans(&self) -> &[Plan] {
        &self.plans
    }

    pub fn lookup(&self, plan_id: &str) -> BillingResult<&Plan> {
        self.plans
            .iter()
            .find(|plan| plan.id == plan_id)
            .ok_or_else(|| BillingError::PlanNotFound(plan_id.to_string()))
    }

    /// Plans a customer can switch to by themselves
    ///
    /// Paid plans only, same billing cycle as the current plan, and large enough
    /// for the current team.
    pub fn valid_plans(&self, current: &Plan, team_size: u32) -> Vec<&Plan> {
        self.plans
            .iter()
            .filter(|plan| {
                !plan.is_free() && plan.cycle == current.cycle && plan.members >= team_size
            })
            .collect()
    }
}
