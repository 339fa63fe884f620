//! API error types

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use upshift_billing::BillingError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Not found")]
    NotFound,

    #[error("{0}")]
    Validation(String),

    /// Billing platform failed or answered with an error
    #[error("Billing platform error: {0}")]
    Upstream(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal server error")]
    Internal,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Database(_) | ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::Validation(msg) | BillingError::InvalidInput(msg) => {
                ApiError::Validation(msg)
            }
            BillingError::WebhookSignatureInvalid => ApiError::Unauthorized,
            BillingError::NotFound(_) => ApiError::NotFound,
            BillingError::Database(msg) => ApiError::Database(msg),
            BillingError::UpstreamApi { .. }
            | BillingError::Timeout
            | BillingError::Http(_)
            | BillingError::Decode(_)
            | BillingError::PaginationLimit { .. } => ApiError::Upstream(e.to_string()),
            BillingError::Config(_) | BillingError::QueueFull | BillingError::QueueClosed => {
                tracing::error!(error = %e, "Unexpected billing error in request handler");
                ApiError::Internal
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Store and upstream details stay in the logs
        let message = match &self {
            ApiError::Database(detail) => {
                tracing::error!(error = %detail, "Database error");
                "Internal server error".to_string()
            }
            ApiError::Upstream(detail) => {
                tracing::error!(error = %detail, "Billing platform error");
                "Billing platform request failed".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}
