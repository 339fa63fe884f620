//! Cancellation executor
//!
//! Runs one reconciliation attempt for a newly activated membership: loads the
//! new plan, gathers the user's other active memberships to the same product,
//! applies the product policy through [`crate::reconciliation`] and cancels the
//! superseded memberships. Every terminal outcome lands in the audit log.
//!
//! Setup faults (unknown new plan, upstream read errors, policy store down)
//! abort the attempt with `success: false`. A failed cancel only affects its
//! own candidate.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::audit::{ActivityContext, AuditLogger};
use crate::client::BillingApi;
use crate::error::{BillingError, BillingResult};
use crate::models::{Membership, Plan};
use crate::policy::{resolve_policy, PolicyResolution, PolicyStore};
use crate::reconciliation::{decide, new_plan_qualifies};

pub const REASON_NOT_RENEWAL: &str = "New plan is not a renewal plan";
pub const REASON_NO_MEMBERSHIPS: &str = "No existing memberships to cancel";
pub const REASON_NO_MATCH: &str = "No memberships matched cancellation criteria";

/// Identifies the membership that was just activated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeRequest {
    pub company_id: String,
    pub membership_id: String,
    pub user_id: String,
    pub product_id: String,
    pub plan_id: String,
}

/// Aggregate outcome of one reconciliation attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeResult {
    pub success: bool,
    pub canceled_memberships: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UpgradeResult {
    pub fn completed(canceled_memberships: Vec<String>) -> Self {
        Self {
            success: true,
            canceled_memberships,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            canceled_memberships: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// Executes reconciliation attempts
#[derive(Clone)]
pub struct UpgradeExecutor {
    billing: Arc<dyn BillingApi>,
    policies: Arc<dyn PolicyStore>,
    audit: AuditLogger,
}

impl UpgradeExecutor {
    pub fn new(
        billing: Arc<dyn BillingApi>,
        policies: Arc<dyn PolicyStore>,
        audit: AuditLogger,
    ) -> Self {
        Self {
            billing,
            policies,
            audit,
        }
    }

    /// Run one attempt; never panics on collaborator failures
    pub async fn process(&self, request: &UpgradeRequest) -> UpgradeResult {
        tracing::info!(
            company_id = %request.company_id,
            membership_id = %request.membership_id,
            user_id = %request.user_id,
            product_id = %request.product_id,
            plan_id = %request.plan_id,
            "Starting upgrade reconciliation"
        );

        match self.reconcile(request).await {
            Ok(canceled) => {
                tracing::info!(
                    membership_id = %request.membership_id,
                    canceled = ?canceled,
                    "Upgrade reconciliation finished"
                );
                UpgradeResult::completed(canceled)
            }
            Err(e) => {
                tracing::error!(
                    company_id = %request.company_id,
                    membership_id = %request.membership_id,
                    user_id = %request.user_id,
                    error = %e,
                    "Upgrade reconciliation aborted"
                );
                UpgradeResult::failed(e.to_string())
            }
        }
    }

    async fn reconcile(&self, request: &UpgradeRequest) -> BillingResult<Vec<String>> {
        let new_plan = self
            .billing
            .get_plan(&request.plan_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Plan {}", request.plan_id)))?;

        let ctx = ActivityContext {
            company_id: request.company_id.clone(),
            user_id: request.user_id.clone(),
            product_id: request.product_id.clone(),
            new_plan_id: request.plan_id.clone(),
            new_plan_name: new_plan.title.clone(),
        };

        let new_terms = new_plan.terms();
        if !new_plan_qualifies(new_terms) {
            tracing::info!(
                plan_id = %new_plan.id,
                plan_type = %new_plan.plan_type,
                "New plan is not recurring, nothing to reconcile"
            );
            self.audit.record(ctx.skipped(None, REASON_NOT_RENEWAL)).await;
            return Ok(Vec::new());
        }

        let existing: Vec<Membership> = self
            .billing
            .list_active_memberships(&request.company_id, &request.user_id, &request.product_id)
            .await?
            .into_iter()
            .filter(|m| m.id != request.membership_id)
            .collect();

        if existing.is_empty() {
            self.audit.record(ctx.skipped(None, REASON_NO_MEMBERSHIPS)).await;
            return Ok(Vec::new());
        }

        let config = match resolve_policy(
            self.policies.as_ref(),
            &request.company_id,
            &request.product_id,
        )
        .await?
        {
            PolicyResolution::Active(config) => config,
            other => {
                let reason = other.skip_reason().unwrap_or("Upgrade protection disabled");
                self.audit.record(ctx.skipped(None, reason)).await;
                return Ok(Vec::new());
            }
        };

        let flags = config.flags();
        let mut plans: HashMap<String, Option<Plan>> = HashMap::new();
        let mut targets: Vec<(&Membership, Plan)> = Vec::new();

        for membership in &existing {
            let plan = match plans.get(&membership.plan_id) {
                Some(cached) => cached.clone(),
                None => {
                    let fetched = self.billing.get_plan(&membership.plan_id).await?;
                    plans.insert(membership.plan_id.clone(), fetched.clone());
                    fetched
                }
            };

            let Some(plan) = plan else {
                tracing::warn!(
                    membership_id = %membership.id,
                    plan_id = %membership.plan_id,
                    "Plan of existing membership not found, skipping candidate"
                );
                continue;
            };

            let decision = decide(new_terms, plan.terms(), flags);
            tracing::info!(
                membership_id = %membership.id,
                existing_plan_id = %plan.id,
                existing_price_cents = plan.effective_price_cents(),
                new_price_cents = new_terms.price_cents,
                decision = %decision,
                "Candidate evaluated"
            );

            if decision.is_cancel() {
                targets.push((membership, plan));
            }
        }

        if targets.is_empty() {
            let first_plan = existing.first().map(|m| m.plan_id.as_str());
            self.audit.record(ctx.skipped(first_plan, REASON_NO_MATCH)).await;
            return Ok(Vec::new());
        }

        let timing = config.cancellation_timing;
        let outcomes = join_all(targets.iter().map(|(membership, _)| {
            self.billing
                .cancel_membership(&request.company_id, &membership.id, timing)
        }))
        .await;

        let mut canceled = Vec::new();
        for ((membership, plan), ok) in targets.iter().zip(outcomes) {
            if ok {
                canceled.push(membership.id.clone());
                self.audit
                    .record(ctx.canceled(&membership.plan_id, Some(&plan.title)))
                    .await;
            } else {
                self.audit
                    .record(ctx.error(
                        &membership.plan_id,
                        Some(&plan.title),
                        format!("Failed to cancel membership {}", membership.id),
                    ))
                    .await;
            }
        }

        Ok(canceled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryAuditStore, InMemoryBilling, InMemoryPolicyStore};
    use crate::models::ProductConfig;
    use upshift_shared::{ActivityStatus, CancellationTiming, PlanType};

    struct Harness {
        billing: Arc<InMemoryBilling>,
        policies: Arc<InMemoryPolicyStore>,
        audit: Arc<InMemoryAuditStore>,
        executor: UpgradeExecutor,
    }

    fn harness(configs: Vec<ProductConfig>) -> Harness {
        let billing = Arc::new(InMemoryBilling::new());
        let policies = Arc::new(InMemoryPolicyStore::with_configs(configs));
        let audit = Arc::new(InMemoryAuditStore::new());
        let executor = UpgradeExecutor::new(
            billing.clone(),
            policies.clone(),
            AuditLogger::new(audit.clone()),
        );
        Harness {
            billing,
            policies,
            audit,
            executor,
        }
    }

    fn enabled_policy() -> ProductConfig {
        ProductConfig {
            enabled: true,
            ..ProductConfig::unconfigured("biz_1", "prod_1")
        }
    }

    fn plan(id: &str, plan_type: PlanType, renewal_price_cents: i64) -> Plan {
        Plan {
            id: id.into(),
            title: format!("{id} plan"),
            product_id: "prod_1".into(),
            plan_type,
            initial_price_cents: 0,
            renewal_price_cents,
        }
    }

    fn membership(id: &str, plan_id: &str) -> Membership {
        Membership {
            id: id.into(),
            user_id: "user_1".into(),
            product_id: "prod_1".into(),
            plan_id: plan_id.into(),
            status: "active".into(),
            canceled_at: None,
            cancel_at_period_end: false,
        }
    }

    fn request(plan_id: &str) -> UpgradeRequest {
        UpgradeRequest {
            company_id: "biz_1".into(),
            membership_id: "mem_new".into(),
            user_id: "user_1".into(),
            product_id: "prod_1".into(),
            plan_id: plan_id.into(),
        }
    }

    /// Existing $old membership plus the freshly activated $new one
    fn seed_pair(h: &Harness, old_cents: i64, new_cents: i64) {
        h.billing.add_plan(plan("plan_old", PlanType::Renewal, old_cents));
        h.billing.add_plan(plan("plan_new", PlanType::Renewal, new_cents));
        h.billing.add_membership(membership("mem_old", "plan_old"));
        h.billing.add_membership(membership("mem_new", "plan_new"));
    }

    #[tokio::test]
    async fn test_upgrade_cancels_lower_tier() {
        let h = harness(vec![enabled_policy()]);
        seed_pair(&h, 1000, 2000);

        let result = h.executor.process(&request("plan_new")).await;

        assert_eq!(result, UpgradeResult::completed(vec!["mem_old".into()]));
        assert_eq!(h.audit.statuses(), vec![ActivityStatus::Canceled]);
        let entry = &h.audit.entries()[0];
        assert_eq!(entry.old_plan_id.as_deref(), Some("plan_old"));
        assert_eq!(entry.old_plan_name.as_deref(), Some("plan_old plan"));
        assert_eq!(entry.new_plan_id, "plan_new");
        assert_eq!(
            h.billing.cancel_calls(),
            vec![("mem_old".to_string(), CancellationTiming::PeriodEnd)]
        );
    }

    #[tokio::test]
    async fn test_downgrade_keeps_existing_by_default() {
        let h = harness(vec![enabled_policy()]);
        seed_pair(&h, 2000, 1000);

        let result = h.executor.process(&request("plan_new")).await;

        assert!(result.success);
        assert!(result.canceled_memberships.is_empty());
        assert!(h.billing.cancel_calls().is_empty());
        let entries = h.audit.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, ActivityStatus::Skipped);
        assert_eq!(entries[0].old_plan_id.as_deref(), Some("plan_old"));
        assert_eq!(entries[0].error_message.as_deref(), Some(REASON_NO_MATCH));
    }

    #[tokio::test]
    async fn test_free_plan_ignored_when_configured() {
        let h = harness(vec![ProductConfig {
            ignore_free_plans: true,
            ..enabled_policy()
        }]);
        seed_pair(&h, 0, 1500);

        let result = h.executor.process(&request("plan_new")).await;

        assert!(result.success);
        assert!(result.canceled_memberships.is_empty());
        assert!(h.billing.cancel_calls().is_empty());
        assert_eq!(h.audit.statuses(), vec![ActivityStatus::Skipped]);
    }

    #[tokio::test]
    async fn test_no_existing_memberships_is_skipped() {
        let h = harness(vec![enabled_policy()]);
        h.billing.add_plan(plan("plan_new", PlanType::Renewal, 2000));
        h.billing.add_membership(membership("mem_new", "plan_new"));

        let result = h.executor.process(&request("plan_new")).await;

        assert_eq!(result, UpgradeResult::completed(Vec::new()));
        let entries = h.audit.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, ActivityStatus::Skipped);
        assert!(entries[0].old_plan_id.is_none());
        assert_eq!(entries[0].error_message.as_deref(), Some(REASON_NO_MEMBERSHIPS));
    }

    #[tokio::test]
    async fn test_failed_cancel_is_logged_as_error_and_batch_succeeds() {
        let h = harness(vec![enabled_policy()]);
        seed_pair(&h, 1000, 2000);
        h.billing.fail_cancel("mem_old");

        let result = h.executor.process(&request("plan_new")).await;

        assert_eq!(result, UpgradeResult::completed(Vec::new()));
        let entries = h.audit.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, ActivityStatus::Error);
        assert_eq!(
            entries[0].error_message.as_deref(),
            Some("Failed to cancel membership mem_old")
        );
    }

    #[tokio::test]
    async fn test_one_failure_does_not_stop_other_candidates() {
        let h = harness(vec![ProductConfig {
            cancellation_timing: CancellationTiming::Immediate,
            ..enabled_policy()
        }]);
        h.billing.add_plan(plan("plan_a", PlanType::Renewal, 500));
        h.billing.add_plan(plan("plan_b", PlanType::Renewal, 900));
        h.billing.add_plan(plan("plan_new", PlanType::Renewal, 2000));
        h.billing.add_membership(membership("mem_a", "plan_a"));
        h.billing.add_membership(membership("mem_b", "plan_b"));
        h.billing.add_membership(membership("mem_new", "plan_new"));
        h.billing.fail_cancel("mem_a");

        let result = h.executor.process(&request("plan_new")).await;

        assert!(result.success);
        assert_eq!(result.canceled_memberships, vec!["mem_b".to_string()]);
        let mut statuses = h.audit.statuses();
        statuses.sort_by_key(|s| s.as_str());
        assert_eq!(statuses, vec![ActivityStatus::Canceled, ActivityStatus::Error]);
        assert_eq!(
            h.billing.membership("mem_b").map(|m| m.status),
            Some("canceled".to_string())
        );
    }

    #[tokio::test]
    async fn test_one_time_new_plan_is_a_no_op() {
        let h = harness(vec![enabled_policy()]);
        h.billing.add_plan(plan("plan_old", PlanType::Renewal, 100));
        h.billing.add_plan(plan("plan_new", PlanType::OneTime, 99_900));
        h.billing.add_membership(membership("mem_old", "plan_old"));

        let result = h.executor.process(&request("plan_new")).await;

        assert_eq!(result, UpgradeResult::completed(Vec::new()));
        assert!(h.billing.cancel_calls().is_empty());
        let entries = h.audit.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].error_message.as_deref(), Some(REASON_NOT_RENEWAL));
    }

    #[tokio::test]
    async fn test_missing_and_disabled_policy_reasons_differ() {
        let h = harness(Vec::new());
        seed_pair(&h, 1000, 2000);

        let result = h.executor.process(&request("plan_new")).await;
        assert_eq!(result, UpgradeResult::completed(Vec::new()));

        h.policies
            .upsert(&crate::policy::PolicyUpdate {
                company_id: "biz_1".into(),
                product_id: "prod_1".into(),
                enabled: false,
                ignore_free_plans: false,
                treat_same_price_as_upgrade: false,
                allow_downgrade_to_cancel: false,
                cancellation_timing: CancellationTiming::PeriodEnd,
            })
            .await
            .unwrap();
        h.executor.process(&request("plan_new")).await;

        let reasons: Vec<_> = h
            .audit
            .entries()
            .into_iter()
            .map(|e| e.error_message.unwrap_or_default())
            .collect();
        assert_eq!(
            reasons,
            vec!["Product not configured", "Upgrade protection disabled"]
        );
        assert!(h.billing.cancel_calls().is_empty());
    }

    #[tokio::test]
    async fn test_policy_store_down_fails_before_candidates() {
        let h = harness(vec![enabled_policy()]);
        seed_pair(&h, 1000, 2000);
        h.policies.set_unavailable(true);

        let result = h.executor.process(&request("plan_new")).await;

        assert!(!result.success);
        assert!(result.error.is_some());
        assert!(h.billing.cancel_calls().is_empty());
        assert!(h.audit.entries().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_new_plan_fails_without_audit() {
        let h = harness(vec![enabled_policy()]);

        let result = h.executor.process(&request("plan_missing")).await;

        assert!(!result.success);
        assert!(h.audit.entries().is_empty());
    }

    #[tokio::test]
    async fn test_upstream_read_error_aborts_attempt() {
        let h = harness(vec![enabled_policy()]);
        seed_pair(&h, 1000, 2000);
        h.billing.set_reads_failing(true);

        let result = h.executor.process(&request("plan_new")).await;

        assert!(!result.success);
        assert!(result.error.unwrap_or_default().contains("503"));
        assert!(h.billing.cancel_calls().is_empty());
    }

    #[tokio::test]
    async fn test_candidate_with_unknown_plan_is_skipped() {
        let h = harness(vec![enabled_policy()]);
        seed_pair(&h, 1000, 2000);
        h.billing.add_membership(membership("mem_orphan", "plan_gone"));

        let result = h.executor.process(&request("plan_new")).await;

        assert_eq!(result.canceled_memberships, vec!["mem_old".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_idempotent() {
        let h = harness(vec![enabled_policy()]);
        seed_pair(&h, 1000, 2000);

        let first_delivery = request("plan_new");
        let second_delivery = request("plan_new");
        let (first, second) = tokio::join!(
            h.executor.process(&first_delivery),
            h.executor.process(&second_delivery)
        );

        assert!(first.success && second.success);
        assert_eq!(first.canceled_memberships, vec!["mem_old".to_string()]);
        assert_eq!(second.canceled_memberships, vec!["mem_old".to_string()]);
        assert!(h
            .audit
            .statuses()
            .iter()
            .all(|s| *s == ActivityStatus::Canceled));
    }

    #[test]
    fn test_result_serializes_camel_case() {
        let body = serde_json::to_value(UpgradeResult::completed(vec!["mem_1".into()])).unwrap();
        assert_eq!(
            body,
            serde_json::json!({"success": true, "canceledMemberships": ["mem_1"]})
        );
    }
}
