//! Gateway webhook ingestion
//!
//! The gateway posts `bt_signature` and `bt_payload` as a form. Well-formed
//! deliveries are queued and acknowledged with 202; the worker verifies and
//! applies them later.

use axum::{extract::State, http::StatusCode, Form, Json};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
pub struct GatewayWebhookForm {
    pub bt_signature: String,
    pub bt_payload: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAccepted {
    pub task_id: Uuid,
}

/// POST /webhooks/gateway
pub async fn receive_gateway_webhook(
    State(state): State<AppState>,
    Form(form): Form<GatewayWebhookForm>,
) -> ApiResult<(StatusCode, Json<WebhookAccepted>)> {
    let task_id = state
        .billing
        .ingestor
        .accept(&form.bt_signature, &form.bt_payload)
        .await?;

    Ok((StatusCode::ACCEPTED, Json(WebhookAccepted { task_id })))
}
