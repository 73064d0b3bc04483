//! HTTP routes

mod billing;
mod webhooks;

use axum::{
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let company_billing = Router::new()
        .route(
            "/subscription",
            get(billing::get_subscription)
                .post(billing::subscribe)
                .delete(billing::cancel_subscription),
        )
        .route("/plan", post(billing::change_plan))
        .route("/vat-id", post(billing::update_vat_id))
        .route("/invoices", get(billing::list_invoices))
        .route("/invoices/{transaction_id}", get(billing::get_invoice));

    Router::new()
        .route("/health", get(health))
        .route("/webhooks/gateway", post(webhooks::receive_gateway_webhook))
        .route("/api/sign-up", post(billing::sign_up))
        .nest("/api/companies/{subdomain}/billing", company_billing)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
