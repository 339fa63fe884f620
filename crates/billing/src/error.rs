//! Billing error types

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// Malformed inbound webhook payload
    #[error("Invalid webhook payload: {0}")]
    Validation(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    /// Non-success response from the billing platform
    #[error("Billing API returned {status}: {body}")]
    UpstreamApi { status: u16, body: String },

    #[error("Billing API request timed out")]
    Timeout,

    #[error("Billing API transport error: {0}")]
    Http(String),

    #[error("Failed to decode billing API response: {0}")]
    Decode(String),

    #[error("Pagination exceeded {max_pages} pages for {resource}")]
    PaginationLimit {
        resource: &'static str,
        max_pages: usize,
    },

    /// Policy or audit store unreachable
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Reconciliation queue is full")]
    QueueFull,

    #[error("Reconciliation queue is shut down")]
    QueueClosed,
}

impl BillingError {
    /// Whether a retry of the same request could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            BillingError::Timeout | BillingError::Http(_) => true,
            BillingError::UpstreamApi { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BillingError::Timeout
        } else if e.is_decode() {
            BillingError::Decode(e.to_string())
        } else {
            BillingError::Http(e.to_string())
        }
    }
}
