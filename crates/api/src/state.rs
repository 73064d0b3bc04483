//! Application state

use std::sync::Arc;

use teamzones_billing::BillingService;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(billing: BillingService) -> Self {
        Self {
            billing: Arc::new(billing),
        }
    }
}
