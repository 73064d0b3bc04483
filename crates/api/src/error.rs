//! API error type and its HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use teamzones_billing::{BillingError, ErrorClass};

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    /// The gateway declined the request (card declined, plan rejected)
    #[error("{0}")]
    PaymentRejected(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::PaymentRejected(_) => StatusCode::PAYMENT_REQUIRED,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation_error",
            ApiError::NotFound(_) => "not_found",
            ApiError::PaymentRejected(_) => "payment_rejected",
            ApiError::Conflict(_) => "conflict",
            ApiError::Unavailable(_) => "unavailable",
            ApiError::Internal(_) => "internal_error",
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        let message = e.to_string();
        match e.class() {
            ErrorClass::Validation | ErrorClass::Signature => ApiError::Validation(message),
            ErrorClass::NotFound => ApiError::NotFound(message),
            ErrorClass::Gateway => ApiError::PaymentRejected(message),
            ErrorClass::Conflict => ApiError::Conflict(message),
            ErrorClass::Transient => ApiError::Unavailable(message),
            ErrorClass::Internal => ApiError::Internal(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::Internal(detail) => {
                tracing::error!(error = %detail, "Internal error while handling request");
                "Internal server error".to_string()
            }
            ApiError::Unavailable(detail) => {
                tracing::warn!(error = %detail, "Dependency unavailable while handling request");
                "Service temporarily unavailable, please retry".to_string()
            }
            other => other.to_string(),
        };

        (
            status,
            Json(ErrorResponse {
                error: self.code(),
                message,
            }),
        )
            .into_response()
    }
}
