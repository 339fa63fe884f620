#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Upshift API Library
//!
//! HTTP surface of the upgrade reconciliation engine: the inbound
//! `membership.activated` webhook, the policy editor, activity and catalog
//! listings for the dashboard, and the user entitlement check.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
