//! Upshift Shared
//!
//! Database plumbing and the small vocabulary types shared by the billing core,
//! the API server and the worker.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod db;
pub mod types;

pub use db::{create_migration_pool, create_pool, run_migrations};
pub use types::{ActivityStatus, CancellationTiming, ParseVariantError, PlanType};
