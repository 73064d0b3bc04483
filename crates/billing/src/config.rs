//! Billing configuration
//!
//! Read once at start-up and injected into the services.

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{BillingError, BillingResult};
use crate::gateway::GatewayConfig;
use crate::queue::{BackoffResolution, DeliveryPolicy, FixedDelay, DEFAULT_MAX_ATTEMPTS};

/// How webhook tasks resolve their tenant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStrategy {
    FixedDelay,
    Backoff,
}

impl std::str::FromStr for ResolutionStrategy {
    type Err = BillingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed-delay" | "fixed" => Ok(ResolutionStrategy::FixedDelay),
            "backoff" => Ok(ResolutionStrategy::Backoff),
            other => Err(BillingError::Config(format!(
                "WEBHOOK_RESOLUTION must be 'fixed-delay' or 'backoff', got '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub gateway: GatewayConfig,
    pub plans_path: PathBuf,
    /// Falls back to the built-in EU table
    pub vat_rates_path: Option<PathBuf>,
    pub vies_url: String,
    pub webhook_delay: time::Duration,
    pub webhook_max_attempts: u32,
    pub resolution: ResolutionStrategy,
}

fn required(name: &str) -> BillingResult<String> {
    std::env::var(name).map_err(|_| BillingError::Config(format!("{} must be set", name)))
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

fn parsed<T: std::str::FromStr>(name: &str, default: T) -> BillingResult<T> {
    match optional(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| BillingError::Config(format!("{} has an invalid value '{}'", name, raw))),
        None => Ok(default),
    }
}

impl BillingConfig {
    pub fn from_env() -> BillingResult<Self> {
        let timeout_secs: u64 = parsed("GATEWAY_TIMEOUT_SECS", 30)?;
        let gateway = GatewayConfig::new(
            required("GATEWAY_BASE_URL")?,
            required("GATEWAY_MERCHANT_ID")?,
            required("GATEWAY_PUBLIC_KEY")?,
            required("GATEWAY_PRIVATE_KEY")?,
        )
        .timeout(std::time::Duration::from_secs(timeout_secs));

        let delay_secs: i64 = parsed("WEBHOOK_DELAY_SECS", 300)?;
        if delay_secs < 0 {
            return Err(BillingError::Config(
                "WEBHOOK_DELAY_SECS must not be negative".to_string(),
            ));
        }

        Ok(Self {
            gateway,
            plans_path: optional("PLANS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/plans.json")),
            vat_rates_path: optional("VAT_RATES_PATH").map(PathBuf::from),
            vies_url: optional("VIES_URL").unwrap_or_else(|| crate::tax::VIES_URL.to_string()),
            webhook_delay: time::Duration::seconds(delay_secs),
            webhook_max_attempts: parsed("WEBHOOK_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?,
            resolution: parsed("WEBHOOK_RESOLUTION", ResolutionStrategy::FixedDelay)?,
        })
    }

    pub fn delivery_policy(&self) -> Arc<dyn DeliveryPolicy> {
        match self.resolution {
            ResolutionStrategy::FixedDelay => Arc::new(FixedDelay {
                delay: self.webhook_delay,
                max_attempts: self.webhook_max_attempts,
            }),
            ResolutionStrategy::Backoff => Arc::new(BackoffResolution {
                max_attempts: self.webhook_max_attempts,
            }),
        }
    }
}
