//! HTTP routes

pub mod access;
pub mod activity;
pub mod catalog;
pub mod health;
pub mod rules;
pub mod webhooks;

#[cfg(test)]
mod tests;

use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyQuery {
    pub company_id: Option<String>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        // Billing platform webhooks
        .route(
            "/api/webhooks/membership-activated",
            post(webhooks::membership_activated),
        )
        // Dashboard
        .route("/api/rules", get(rules::get_rules).post(rules::save_rules))
        .route("/api/configs", get(activity::list_configs))
        .route("/api/activity", get(activity::list_activity))
        .route("/api/plans", get(catalog::list_plans))
        .route("/api/products", get(catalog::list_products))
        .route("/api/access/check", get(access::check_access))
        .with_state(state)
}
