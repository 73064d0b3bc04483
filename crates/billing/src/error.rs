//! Billing errors

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

/// Coarse classification used by callers to decide how to surface or retry a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Caller-correctable, nothing was mutated
    Validation,
    /// The gateway rejected the call
    Gateway,
    /// A company, subscription or transaction could not be resolved
    NotFound,
    /// Network/timeout or storage hiccup, safe to retry
    Transient,
    /// Webhook authenticity check failed
    Signature,
    /// Optimistic transaction kept losing to concurrent writers
    Conflict,
    Internal,
}

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Unknown subscription plan: {0}")]
    PlanNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid subscription state: {0}")]
    InvalidState(String),

    #[error("Subdomain already taken: {0}")]
    SubdomainTaken(String),

    #[error("Company not found: {0}")]
    CompanyNotFound(String),

    #[error("No company mapped to subscription {0}")]
    SubscriptionNotMapped(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transaction is not an invoice: {0}")]
    NotInvoice(String),

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Gateway unavailable: {0}")]
    GatewayTransient(String),

    #[error("Webhook signature invalid")]
    WebhookSignatureInvalid,

    #[error("Webhook payload malformed: {0}")]
    WebhookMalformed(String),

    #[error("Concurrent update conflict on company {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    pub fn class(&self) -> ErrorClass {
        match self {
            BillingError::InvalidPlan(_)
            | BillingError::PlanNotFound(_)
            | BillingError::InvalidInput(_)
            | BillingError::InvalidState(_)
            | BillingError::SubdomainTaken(_)
            | BillingError::WebhookMalformed(_) => ErrorClass::Validation,
            BillingError::Gateway(_) => ErrorClass::Gateway,
            BillingError::CompanyNotFound(_)
            | BillingError::SubscriptionNotMapped(_)
            | BillingError::NotFound(_)
            | BillingError::NotInvoice(_) => ErrorClass::NotFound,
            BillingError::GatewayTransient(_) | BillingError::Database(_) => ErrorClass::Transient,
            BillingError::WebhookSignatureInvalid => ErrorClass::Signature,
            BillingError::Conflict(_) => ErrorClass::Conflict,
            BillingError::Config(_) | BillingError::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Whether retrying the same operation later can succeed
    pub fn is_transient(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient | ErrorClass::Conflict)
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            BillingError::GatewayTransient(e.to_string())
        } else {
            BillingError::Gateway(e.to_string())
        }
    }
}
