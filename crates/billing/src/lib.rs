// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Upshift Billing Module
//!
//! Reconciles a user's memberships when they buy a new plan of a product they
//! already subscribe to: the superseded memberships are canceled according to
//! the product's policy.
//!
//! ## Features
//!
//! - **Billing API Client**: Paginated reads and membership cancellation against the billing platform
//! - **Policies**: Per-product automation settings stored in Postgres
//! - **Decision Engine**: Pure price comparison of the new plan against each existing plan
//! - **Executor**: Runs one reconciliation attempt and cancels superseded memberships
//! - **Audit Log**: Append-only record of every outcome
//! - **Entitlement Gate**: Only paying customers of the operator's product are served
//! - **Queue**: Supervised background execution of reconciliation jobs
//! - **Webhooks**: Payload parsing and signature verification

pub mod audit;
pub mod client;
pub mod entitlement;
pub mod error;
pub mod executor;
pub mod mapping;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod models;
pub mod policy;
pub mod queue;
pub mod reconciliation;
pub mod webhooks;

// Audit
pub use audit::{ActivityContext, AuditLogger, AuditStore, PgAuditStore};

// Client
pub use client::{BillingApi, BillingApiClient, BillingConfig};

// Entitlement
pub use entitlement::{
    AllowAll, Entitlement, EntitlementChecker, EntitlementService, ENTITLEMENT_TIMEOUT,
};

// Error
pub use error::{BillingError, BillingResult};

// Executor
pub use executor::{UpgradeExecutor, UpgradeRequest, UpgradeResult};

// Models
pub use models::{
    ActivityLog, Membership, NewActivityLog, Plan, PlanTerms, PolicyFlags, Product, ProductConfig,
};

// Policy
pub use policy::{resolve_policy, PgPolicyStore, PolicyResolution, PolicyStore, PolicyUpdate};

// Queue
pub use queue::{
    QueueConfig, QueueStats, QueueSupervisor, ReconciliationHandler, ReconciliationQueue,
};

// Decision engine
pub use reconciliation::{decide, CancelReason, Decision, KeepReason};

// Webhooks
pub use webhooks::{parse_event, verify_signature, SignatureHeaders, WebhookEvent};

use std::sync::Arc;

use sqlx::PgPool;

/// Reconciliation collaborators wired together
#[derive(Clone)]
pub struct ReconciliationService {
    pub billing: Arc<dyn BillingApi>,
    pub policies: Arc<dyn PolicyStore>,
    pub audit: AuditLogger,
    pub executor: UpgradeExecutor,
    /// Billing access for the entitlement gate, which runs before the webhook
    /// is acknowledged
    pub entitlement_billing: Arc<dyn BillingApi>,
}

impl ReconciliationService {
    /// Create the service from environment variables and a database pool
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        Self::with_client(
            BillingApiClient::from_env()?,
            Arc::new(PgPolicyStore::new(pool.clone())),
            Arc::new(PgAuditStore::new(pool)),
        )
    }

    /// Wire a real client. The entitlement gate gets a single-attempt copy
    /// bounded by [`ENTITLEMENT_TIMEOUT`].
    pub fn with_client(
        client: BillingApiClient,
        policies: Arc<dyn PolicyStore>,
        audit_store: Arc<dyn AuditStore>,
    ) -> BillingResult<Self> {
        let gate_client = client.fail_fast(ENTITLEMENT_TIMEOUT)?;
        let mut service = Self::new(Arc::new(client), policies, audit_store);
        service.entitlement_billing = Arc::new(gate_client);
        Ok(service)
    }

    /// Create the service from explicit collaborators
    pub fn new(
        billing: Arc<dyn BillingApi>,
        policies: Arc<dyn PolicyStore>,
        audit_store: Arc<dyn AuditStore>,
    ) -> Self {
        let audit = AuditLogger::new(audit_store);
        let executor = UpgradeExecutor::new(billing.clone(), policies.clone(), audit.clone());

        Self {
            entitlement_billing: billing.clone(),
            billing,
            policies,
            audit,
            executor,
        }
    }
}
