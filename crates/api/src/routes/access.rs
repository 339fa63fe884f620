//! Entitlement check for the embedded dashboard
//!
//! The caller identifies itself with an HS256 JWT in `x-user-token`; the
//! `sub` claim is the billing platform user id.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::state::AppState;

pub const USER_TOKEN_HEADER: &str = "x-user-token";

#[derive(Debug, Serialize, Deserialize)]
pub struct UserTokenClaims {
    pub sub: String,
    pub exp: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessResponse {
    pub has_access: bool,
    pub access_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn denied(status: StatusCode, error: &str) -> Response {
    (
        status,
        Json(AccessResponse {
            has_access: false,
            access_level: None,
            error: Some(error.to_string()),
        }),
    )
        .into_response()
}

/// Verify a user token and return its subject
pub fn verify_user_token(token: &str, secret: &str) -> Option<String> {
    let validation = Validation::new(Algorithm::HS256);
    match decode::<UserTokenClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    ) {
        Ok(data) if !data.claims.sub.is_empty() => Some(data.claims.sub),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!(error = %e, "User token rejected");
            None
        }
    }
}

/// GET /api/access/check
pub async fn check_access(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(secret) = state.config.user_token_secret.as_deref() else {
        tracing::error!("Access check called without USER_TOKEN_SECRET configured");
        return denied(StatusCode::INTERNAL_SERVER_ERROR, "User token verification not configured");
    };

    let Some(token) = headers
        .get(USER_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|t| !t.is_empty())
    else {
        return denied(StatusCode::UNAUTHORIZED, "Missing user token");
    };

    let Some(user_id) = verify_user_token(token, secret) else {
        return denied(StatusCode::UNAUTHORIZED, "Invalid user token");
    };

    let entitlement = state.entitlement.check(&user_id).await;

    Json(AccessResponse {
        has_access: entitlement.has_access,
        access_level: entitlement.access_level,
        error: None,
    })
    .into_response()
}
