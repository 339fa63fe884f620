//! Application state

use std::sync::Arc;

use upshift_billing::{
    AllowAll, AuditStore, BillingApi, EntitlementChecker, EntitlementService, PolicyStore,
    ReconciliationQueue, ReconciliationService,
};

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub billing: Arc<dyn BillingApi>,
    pub policies: Arc<dyn PolicyStore>,
    pub audit: Arc<dyn AuditStore>,
    /// Gate in front of reconciliation
    pub entitlement: Arc<dyn EntitlementChecker>,
    /// Background reconciliation jobs
    pub queue: ReconciliationQueue,
}

impl AppState {
    pub fn new(config: Config, service: &ReconciliationService, queue: ReconciliationQueue) -> Self {
        let entitlement: Arc<dyn EntitlementChecker> = if config.entitlement_gate_enabled {
            if config.gating_product_id.is_empty() || config.gating_company_id.is_empty() {
                tracing::warn!(
                    "Entitlement gate enabled without GATING_COMPANY_ID/GATING_PRODUCT_ID - every webhook will be skipped"
                );
            } else {
                tracing::info!(
                    gating_product_id = %config.gating_product_id,
                    "Entitlement gate enabled"
                );
            }
            Arc::new(EntitlementService::new(
                service.entitlement_billing.clone(),
                config.gating_company_id.clone(),
                config.gating_product_id.clone(),
            ))
        } else {
            tracing::warn!("Entitlement gate disabled via config (ENTITLEMENT_GATE_ENABLED=false)");
            Arc::new(AllowAll)
        };

        if config.webhook_secret.is_none() {
            tracing::warn!("Webhook signature verification not configured (missing WEBHOOK_SECRET)");
        }

        Self::from_parts(
            config,
            service.billing.clone(),
            service.policies.clone(),
            service.audit.store().clone(),
            entitlement,
            queue,
        )
    }

    /// Assemble state from explicit collaborators
    pub fn from_parts(
        config: Config,
        billing: Arc<dyn BillingApi>,
        policies: Arc<dyn PolicyStore>,
        audit: Arc<dyn AuditStore>,
        entitlement: Arc<dyn EntitlementChecker>,
        queue: ReconciliationQueue,
    ) -> Self {
        Self {
            config,
            billing,
            policies,
            audit,
            entitlement,
            queue,
        }
    }
}
