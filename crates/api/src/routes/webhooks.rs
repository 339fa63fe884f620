//! Inbound billing platform webhooks
//!
//! Answers 400 for malformed `membership.activated` payloads and 401 for bad
//! signatures. Everything else is acknowledged with 200, including internal
//! faults, so the sender never starts a redelivery storm. Reconciliation runs
//! on the supervised queue after the response is sent.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use time::OffsetDateTime;
use upshift_billing::{parse_event, verify_signature, SignatureHeaders, WebhookEvent};

use crate::state::AppState;

const ACK: &str = "OK";

/// POST /api/webhooks/membership-activated
pub async fn membership_activated(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(secret) = &state.config.webhook_secret {
        if let Err(response) = check_signature(secret, &headers, &body) {
            return response;
        }
    }

    let request = match parse_event(&body) {
        Ok(WebhookEvent::MembershipActivated(request)) => request,
        Ok(WebhookEvent::Ignored(event_type)) => {
            tracing::debug!(event_type = %event_type, "Ignoring webhook event");
            return (StatusCode::OK, ACK).into_response();
        }
        Err(e) => {
            tracing::warn!(error = %e, "Rejecting malformed webhook");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    let entitlement = state.entitlement.check(&request.user_id).await;
    if !entitlement.has_access {
        tracing::info!(
            company_id = %request.company_id,
            user_id = %request.user_id,
            membership_id = %request.membership_id,
            "No entitlement, skipping reconciliation"
        );
        return (StatusCode::OK, ACK).into_response();
    }

    let membership_id = request.membership_id.clone();
    match state.queue.enqueue(request) {
        Ok(()) => {
            tracing::info!(membership_id = %membership_id, "Reconciliation queued");
        }
        Err(e) => {
            // Still acknowledged; the failure is visible in logs only
            tracing::error!(
                membership_id = %membership_id,
                error = %e,
                "Failed to queue reconciliation"
            );
        }
    }

    (StatusCode::OK, ACK).into_response()
}

fn check_signature(secret: &str, headers: &HeaderMap, body: &[u8]) -> Result<(), Response> {
    let signature_headers = SignatureHeaders {
        id: header_str(headers, "webhook-id"),
        timestamp: header_str(headers, "webhook-timestamp"),
        signature: header_str(headers, "webhook-signature"),
    };

    verify_signature(
        secret,
        &signature_headers,
        body,
        OffsetDateTime::now_utc().unix_timestamp(),
    )
    .map_err(|e| (StatusCode::UNAUTHORIZED, e.to_string()).into_response())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}
