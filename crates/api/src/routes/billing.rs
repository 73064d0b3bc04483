//! Company billing routes
//!
//! Thin wrappers over the subscription and ledger services. The subdomain in
//! the path is trusted; the outer layer has already authorised the caller.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use teamzones_billing::{Company, LedgerRecord, SignUp, SubscribeRequest, SubscriptionSummary};

use crate::{error::ApiResult, state::AppState};

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePlanRequest {
    pub plan_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VatIdRequest {
    #[serde(default)]
    pub vat_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceResponse {
    #[serde(flatten)]
    pub record: LedgerRecord,
    pub dollar_amount: String,
    pub vat_dollar_amount: String,
    pub includes_vat: bool,
}

impl From<LedgerRecord> for InvoiceResponse {
    fn from(record: LedgerRecord) -> Self {
        Self {
            dollar_amount: record.dollar_amount(),
            vat_dollar_amount: record.vat_dollar_amount(),
            includes_vat: record.includes_vat(),
            record,
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// POST /api/sign-up
pub async fn sign_up(
    State(state): State<AppState>,
    Json(request): Json<SignUp>,
) -> ApiResult<(StatusCode, Json<Company>)> {
    let company = state.billing.subscriptions.sign_up(&request).await?;
    Ok((StatusCode::CREATED, Json(company)))
}

/// GET /api/companies/{subdomain}/billing/subscription
pub async fn get_subscription(
    State(state): State<AppState>,
    Path(subdomain): Path<String>,
) -> ApiResult<Json<SubscriptionSummary>> {
    let summary = state
        .billing
        .subscriptions
        .current_subscription(&subdomain)
        .await?;
    Ok(Json(summary))
}

/// POST /api/companies/{subdomain}/billing/subscription
///
/// Upgrades a free company to a paid plan.
pub async fn subscribe(
    State(state): State<AppState>,
    Path(subdomain): Path<String>,
    Json(request): Json<SubscribeRequest>,
) -> ApiResult<Json<Company>> {
    let company = state
        .billing
        .subscriptions
        .subscribe(&subdomain, &request)
        .await?;
    Ok(Json(company))
}

/// DELETE /api/companies/{subdomain}/billing/subscription
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Path(subdomain): Path<String>,
) -> ApiResult<Json<Company>> {
    let company = state.billing.subscriptions.cancel(&subdomain).await?;
    Ok(Json(company))
}

/// POST /api/companies/{subdomain}/billing/plan
pub async fn change_plan(
    State(state): State<AppState>,
    Path(subdomain): Path<String>,
    Json(request): Json<ChangePlanRequest>,
) -> ApiResult<Json<Company>> {
    let company = state
        .billing
        .subscriptions
        .update_plan(&subdomain, &request.plan_id)
        .await?;
    Ok(Json(company))
}

/// POST /api/companies/{subdomain}/billing/vat-id
pub async fn update_vat_id(
    State(state): State<AppState>,
    Path(subdomain): Path<String>,
    Json(request): Json<VatIdRequest>,
) -> ApiResult<Json<Company>> {
    let company = state
        .billing
        .subscriptions
        .update_vat_id(&subdomain, &request.vat_id)
        .await?;
    Ok(Json(company))
}

/// GET /api/companies/{subdomain}/billing/invoices
pub async fn list_invoices(
    State(state): State<AppState>,
    Path(subdomain): Path<String>,
) -> ApiResult<Json<Vec<InvoiceResponse>>> {
    let invoices = state.billing.ledger.find_invoices(&subdomain).await?;
    Ok(Json(invoices.into_iter().map(InvoiceResponse::from).collect()))
}

/// GET /api/companies/{subdomain}/billing/invoices/{transaction_id}
pub async fn get_invoice(
    State(state): State<AppState>,
    Path((subdomain, transaction_id)): Path<(String, String)>,
) -> ApiResult<Json<InvoiceResponse>> {
    let invoice = state
        .billing
        .ledger
        .get_invoice(&subdomain, &transaction_id)
        .await?;
    Ok(Json(invoice.into()))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::json;

    use crate::routes::test_support::{app, json_body, json_request, send, TestApp};

    async fn free_company(app: &TestApp) {
        app.state
            .billing
            .subscriptions
            .register_free("acme", "Acme")
            .await
            .unwrap();
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_sign_up_on_free_plan() {
        let app = app();
        let response = send(
            &app,
            json_request(
                "POST",
                "/api/sign-up",
                json!({
                    "subdomain": "acme",
                    "companyName": "Acme",
                    "planId": "free",
                    "paymentNonce": "",
                    "country": "",
                    "vatId": ""
                }),
            ),
        )
        .await;

        assert_eq!(response.status(), StatusCode::CREATED);
        let body = json_body(response).await;
        assert_eq!(body["subdomain"], "acme");
        assert_eq!(body["subscriptionPlanId"], "free");
        assert_eq!(body["subscriptionStatus"], "Active");
    }

    #[tokio::test]
    async fn test_sign_up_with_unknown_plan_is_rejected() {
        let app = app();
        let response = send(
            &app,
            json_request(
                "POST",
                "/api/sign-up",
                json!({
                    "subdomain": "acme",
                    "companyName": "Acme",
                    "planId": "enterprise",
                    "paymentNonce": "nonce",
                    "country": "DE",
                    "vatId": ""
                }),
            ),
        )
        .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "validation_error");
    }

    #[tokio::test]
    async fn test_subscription_summary() {
        let app = app();
        free_company(&app).await;

        let response = send(&app, get("/api/companies/acme/billing/subscription")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["planId"], "free");
        assert_eq!(body["status"], "Active");
        assert!(!body["plans"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_company_is_not_found() {
        let app = app();
        let response = send(&app, get("/api/companies/ghost/billing/subscription")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cancel_without_subscription_is_rejected() {
        let app = app();
        free_company(&app).await;

        let response = send(
            &app,
            Request::builder()
                .method("DELETE")
                .uri("/api/companies/acme/billing/subscription")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_clearing_vat_id_on_free_plan() {
        let app = app();
        free_company(&app).await;

        let response = send(
            &app,
            json_request(
                "POST",
                "/api/companies/acme/billing/vat-id",
                json!({ "vatId": "" }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["subscriptionVatId"], "");
    }

    #[tokio::test]
    async fn test_invoices_empty_and_missing() {
        let app = app();
        free_company(&app).await;

        let response = send(&app, get("/api/companies/acme/billing/invoices")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!([]));

        let response = send(&app, get("/api/companies/acme/billing/invoices/txn_1")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
