//! Billing platform webhooks
//!
//! Parses inbound event payloads into reconciliation requests and verifies
//! Standard Webhooks signatures (`webhook-id`, `webhook-timestamp`,
//! `webhook-signature`).
//!
//! Two payload layouts are accepted for `membership.activated`:
//!
//! ```text
//! { "type": ..., "data": { "membership": {..}, "user": {..}, "product": {..}, "plan": {..} } }
//! { "type": ..., "data": { "id": ..., "user": {..}, "product": {..}, "plan": {..} } }
//! ```
//!
//! The company id is taken from the first present of: envelope `company_id`,
//! `data.company_id`, `membership.company_id`, `membership.company.id`,
//! `data.company.id`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;

use crate::error::{BillingError, BillingResult};
use crate::executor::UpgradeRequest;
use crate::mapping::first_str;

type HmacSha256 = Hmac<Sha256>;

pub const MEMBERSHIP_ACTIVATED: &str = "membership.activated";

/// Maximum age of a signed delivery, in seconds
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// A parsed inbound event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEvent {
    MembershipActivated(UpgradeRequest),
    /// Any other event type; acknowledged and dropped
    Ignored(String),
}

/// Parse a raw webhook body
///
/// Fails with [`BillingError::Validation`] when the body is not JSON or a
/// `membership.activated` event lacks one of its required parts.
pub fn parse_event(body: &[u8]) -> BillingResult<WebhookEvent> {
    let envelope: Value = serde_json::from_slice(body)
        .map_err(|e| BillingError::Validation(format!("body is not valid JSON: {}", e)))?;

    let event_type = first_str(&envelope, &[&["type"], &["action"]]).unwrap_or_default();
    if event_type != MEMBERSHIP_ACTIVATED {
        return Ok(WebhookEvent::Ignored(event_type));
    }

    let data = envelope
        .get("data")
        .filter(|d| d.is_object())
        .ok_or_else(|| BillingError::Validation("missing data object".to_string()))?;

    let membership = match data.get("membership") {
        Some(m) if m.is_object() => m,
        Some(_) => {
            return Err(BillingError::Validation(
                "membership is not an object".to_string(),
            ))
        }
        None => data,
    };

    let membership_id = first_str(membership, &[&["id"]])
        .ok_or_else(|| BillingError::Validation("missing membership".to_string()))?;
    let user_id = nested_id(data, membership, "user")?;
    let product_id = nested_id(data, membership, "product")?;
    let plan_id = nested_id(data, membership, "plan")?;

    let company_id = first_str(&envelope, &[&["company_id"]])
        .or_else(|| first_str(data, &[&["company_id"]]))
        .or_else(|| first_str(membership, &[&["company_id"], &["company", "id"]]))
        .or_else(|| first_str(data, &[&["company", "id"]]))
        .ok_or_else(|| BillingError::Validation("missing company_id".to_string()))?;

    Ok(WebhookEvent::MembershipActivated(UpgradeRequest {
        company_id,
        membership_id,
        user_id,
        product_id,
        plan_id,
    }))
}

/// `data.<key>.id`, falling back to `membership.<key>.id`
fn nested_id(data: &Value, membership: &Value, key: &str) -> BillingResult<String> {
    first_str(data, &[&[key, "id"]])
        .or_else(|| first_str(membership, &[&[key, "id"]]))
        .ok_or_else(|| BillingError::Validation(format!("missing {}", key)))
}

/// Signature headers of one delivery
#[derive(Debug, Clone, Copy)]
pub struct SignatureHeaders<'a> {
    pub id: &'a str,
    pub timestamp: &'a str,
    pub signature: &'a str,
}

/// Verify a Standard Webhooks signature
///
/// `secret` may carry the `whsec_` prefix, in which case the rest is the
/// base64 key. The signature header holds space separated `v1,<base64>`
/// entries; any matching entry is accepted.
pub fn verify_signature(
    secret: &str,
    headers: &SignatureHeaders<'_>,
    body: &[u8],
    now_unix: i64,
) -> BillingResult<()> {
    let timestamp: i64 = headers.timestamp.trim().parse().map_err(|_| {
        tracing::warn!(timestamp = %headers.timestamp, "Malformed webhook timestamp");
        BillingError::WebhookSignatureInvalid
    })?;

    if now_unix.abs_diff(timestamp) > SIGNATURE_TOLERANCE_SECS.unsigned_abs() {
        tracing::warn!(
            timestamp = timestamp,
            now = now_unix,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let key = match secret.strip_prefix("whsec_") {
        Some(encoded) => BASE64
            .decode(encoded)
            .unwrap_or_else(|_| encoded.as_bytes().to_vec()),
        None => secret.as_bytes().to_vec(),
    };

    let mut mac = HmacSha256::new_from_slice(&key).map_err(|_| {
        tracing::error!("Invalid webhook secret key");
        BillingError::WebhookSignatureInvalid
    })?;
    mac.update(headers.id.as_bytes());
    mac.update(b".");
    mac.update(headers.timestamp.trim().as_bytes());
    mac.update(b".");
    mac.update(body);

    let matched = headers
        .signature
        .split_whitespace()
        .filter_map(|entry| entry.strip_prefix("v1,"))
        .filter_map(|encoded| BASE64.decode(encoded).ok())
        .any(|candidate| mac.clone().verify_slice(&candidate).is_ok());

    if !matched {
        tracing::warn!(webhook_id = %headers.id, "Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// Produce a `v1,<base64>` signature entry
pub fn sign(secret: &[u8], id: &str, timestamp: i64, body: &[u8]) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|_| BillingError::Config("Invalid webhook secret key".to_string()))?;
    mac.update(format!("{}.{}.", id, timestamp).as_bytes());
    mac.update(body);
    Ok(format!("v1,{}", BASE64.encode(mac.finalize().into_bytes())))
}
