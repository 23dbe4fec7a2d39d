//! Error types for the Billing API

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use vendera_billing::BillingError;

/// API error response envelope
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

/// API error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Billing(#[from] BillingError),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Billing(e) => match e {
                BillingError::NotFound(_) => StatusCode::NOT_FOUND,
                BillingError::UnknownPlan(_) | BillingError::Validation(_) => {
                    StatusCode::BAD_REQUEST
                }
                BillingError::InvalidTransition(_)
                | BillingError::NotEligible(_)
                | BillingError::ConcurrentModification(_) => StatusCode::CONFLICT,
                BillingError::ChargeFailed(_) => StatusCode::PAYMENT_REQUIRED,
                BillingError::Gateway(_) => StatusCode::BAD_GATEWAY,
                BillingError::Unauthorized => StatusCode::UNAUTHORIZED,
                BillingError::WebhookSignatureInvalid => StatusCode::BAD_REQUEST,
                BillingError::Database(_) | BillingError::Config(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Billing(e) => match e {
                BillingError::NotFound(_) => "SUBSCRIPTION_NOT_FOUND",
                BillingError::UnknownPlan(_) => "UNKNOWN_PLAN",
                BillingError::Validation(_) => "VALIDATION_FAILED",
                BillingError::InvalidTransition(_) => "INVALID_TRANSITION",
                BillingError::NotEligible(_) => "NOT_ELIGIBLE",
                BillingError::ConcurrentModification(_) => "CONCURRENT_MODIFICATION",
                BillingError::ChargeFailed(_) => "CHARGE_FAILED",
                BillingError::Gateway(_) => "GATEWAY_ERROR",
                BillingError::Unauthorized => "UNAUTHORIZED",
                BillingError::WebhookSignatureInvalid => "WEBHOOK_SIGNATURE_INVALID",
                BillingError::Database(_) | BillingError::Config(_) => "INTERNAL_ERROR",
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            tracing::error!(error = ?self, "Internal API error");
        }

        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.error_code().to_string(),
                message: self.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn billing_errors_map_to_expected_statuses() {
        let cases = [
            (
                ApiError::from(BillingError::NotFound("x".into())),
                StatusCode::NOT_FOUND,
            ),
            (
                ApiError::from(BillingError::UnknownPlan("x".into())),
                StatusCode::BAD_REQUEST,
            ),
            (
                ApiError::from(BillingError::NotEligible("x".into())),
                StatusCode::CONFLICT,
            ),
            (
                ApiError::from(BillingError::ChargeFailed("x".into())),
                StatusCode::PAYMENT_REQUIRED,
            ),
            (
                ApiError::from(BillingError::Unauthorized),
                StatusCode::UNAUTHORIZED,
            ),
            (
                ApiError::from(BillingError::Database("x".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.status_code(), expected);
        }
    }
}
