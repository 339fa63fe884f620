//! In-memory collaborator implementations
//!
//! Used by tests and local runs without Postgres or the billing platform. Each
//! store can be switched to an "unavailable" mode that fails every call with a
//! database error.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use time::OffsetDateTime;
use upshift_shared::{ActivityStatus, CancellationTiming};
use uuid::Uuid;

use crate::audit::AuditStore;
use crate::client::BillingApi;
use crate::error::{BillingError, BillingResult};
use crate::models::{ActivityLog, Membership, NewActivityLog, Plan, Product, ProductConfig};
use crate::policy::{PolicyStore, PolicyUpdate};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn check_available(flag: &AtomicBool) -> BillingResult<()> {
    if flag.load(Ordering::SeqCst) {
        return Err(BillingError::Database("store unavailable".to_string()));
    }
    Ok(())
}

#[derive(Default)]
pub struct InMemoryPolicyStore {
    configs: Mutex<HashMap<(String, String), ProductConfig>>,
    unavailable: AtomicBool,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_configs(configs: Vec<ProductConfig>) -> Self {
        let map = configs
            .into_iter()
            .map(|c| ((c.company_id.clone(), c.product_id.clone()), c))
            .collect();
        Self {
            configs: Mutex::new(map),
            unavailable: AtomicBool::new(false),
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn get(&self, company_id: &str, product_id: &str) -> BillingResult<Option<ProductConfig>> {
        check_available(&self.unavailable)?;
        Ok(lock(&self.configs)
            .get(&(company_id.to_string(), product_id.to_string()))
            .cloned())
    }

    async fn upsert(&self, update: &PolicyUpdate) -> BillingResult<ProductConfig> {
        check_available(&self.unavailable)?;
        let mut configs = lock(&self.configs);
        let key = (update.company_id.clone(), update.product_id.clone());
        let now = OffsetDateTime::now_utc();

        let config = ProductConfig {
            company_id: update.company_id.clone(),
            product_id: update.product_id.clone(),
            enabled: update.enabled,
            ignore_free_plans: update.ignore_free_plans,
            treat_same_price_as_upgrade: update.treat_same_price_as_upgrade,
            allow_downgrade_to_cancel: update.allow_downgrade_to_cancel,
            cancellation_timing: update.cancellation_timing,
            created_at: configs.get(&key).and_then(|c| c.created_at).or(Some(now)),
            updated_at: Some(now),
        };

        configs.insert(key, config.clone());
        Ok(config)
    }

    async fn list_configured_products(&self, company_id: &str) -> BillingResult<Vec<String>> {
        check_available(&self.unavailable)?;
        let mut ids: Vec<String> = lock(&self.configs)
            .keys()
            .filter(|(company, _)| company == company_id)
            .map(|(_, product)| product.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[derive(Default)]
pub struct InMemoryAuditStore {
    entries: Mutex<Vec<ActivityLog>>,
    unavailable: AtomicBool,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Every stored row in insertion order
    pub fn entries(&self) -> Vec<ActivityLog> {
        lock(&self.entries).clone()
    }

    pub fn statuses(&self) -> Vec<ActivityStatus> {
        lock(&self.entries).iter().map(|e| e.status).collect()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn insert(&self, entry: &NewActivityLog) -> BillingResult<()> {
        check_available(&self.unavailable)?;
        lock(&self.entries).push(ActivityLog {
            id: Uuid::new_v4(),
            company_id: entry.company_id.clone(),
            user_id: entry.user_id.clone(),
            product_id: entry.product_id.clone(),
            old_plan_id: entry.old_plan_id.clone(),
            new_plan_id: entry.new_plan_id.clone(),
            old_plan_name: entry.old_plan_name.clone(),
            new_plan_name: entry.new_plan_name.clone(),
            status: entry.status,
            error_message: entry.error_message.clone(),
            created_at: OffsetDateTime::now_utc(),
        });
        Ok(())
    }

    async fn recent(&self, company_id: &str, limit: i64) -> BillingResult<Vec<ActivityLog>> {
        check_available(&self.unavailable)?;
        let limit = usize::try_from(limit.max(0)).unwrap_or(0);
        Ok(lock(&self.entries)
            .iter()
            .rev()
            .filter(|e| e.company_id == company_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_since(
        &self,
        status: ActivityStatus,
        since: OffsetDateTime,
    ) -> BillingResult<i64> {
        check_available(&self.unavailable)?;
        let count = lock(&self.entries)
            .iter()
            .filter(|e| e.status == status && e.created_at >= since)
            .count();
        Ok(count as i64)
    }
}

#[derive(Default)]
struct BillingState {
    products: Vec<Product>,
    plans: HashMap<String, Plan>,
    memberships: Vec<Membership>,
    failing_cancels: HashSet<String>,
    cancel_calls: Vec<(String, CancellationTiming)>,
    reads_failing: bool,
}

/// Billing platform double
///
/// Cancels mutate the stored membership the way the platform does: an
/// immediate cancel ends it, a period-end cancel flags it.
#[derive(Default)]
pub struct InMemoryBilling {
    state: Mutex<BillingState>,
}

impl InMemoryBilling {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_product(&self, product: Product) {
        lock(&self.state).products.push(product);
    }

    pub fn add_plan(&self, plan: Plan) {
        lock(&self.state).plans.insert(plan.id.clone(), plan);
    }

    pub fn add_membership(&self, membership: Membership) {
        lock(&self.state).memberships.push(membership);
    }

    /// Make every cancel of this membership fail
    pub fn fail_cancel(&self, membership_id: &str) {
        lock(&self.state)
            .failing_cancels
            .insert(membership_id.to_string());
    }

    /// Make every read answer 503
    pub fn set_reads_failing(&self, failing: bool) {
        lock(&self.state).reads_failing = failing;
    }

    pub fn cancel_calls(&self) -> Vec<(String, CancellationTiming)> {
        lock(&self.state).cancel_calls.clone()
    }

    pub fn membership(&self, membership_id: &str) -> Option<Membership> {
        lock(&self.state)
            .memberships
            .iter()
            .find(|m| m.id == membership_id)
            .cloned()
    }

    fn check_reads(state: &BillingState) -> BillingResult<()> {
        if state.reads_failing {
            return Err(BillingError::UpstreamApi {
                status: 503,
                body: "service unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl BillingApi for InMemoryBilling {
    async fn list_products(&self, company_id: &str) -> BillingResult<Vec<Product>> {
        let state = lock(&self.state);
        Self::check_reads(&state)?;
        Ok(state
            .products
            .iter()
            .filter(|p| p.company_id == company_id)
            .cloned()
            .collect())
    }

    async fn list_plans(&self, _company_id: &str, product_id: &str) -> BillingResult<Vec<Plan>> {
        let state = lock(&self.state);
        Self::check_reads(&state)?;
        let mut plans: Vec<Plan> = state
            .plans
            .values()
            .filter(|p| p.product_id == product_id)
            .cloned()
            .collect();
        plans.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(plans)
    }

    async fn get_plan(&self, plan_id: &str) -> BillingResult<Option<Plan>> {
        let state = lock(&self.state);
        Self::check_reads(&state)?;
        Ok(state.plans.get(plan_id).cloned())
    }

    async fn list_active_memberships(
        &self,
        _company_id: &str,
        user_id: &str,
        product_id: &str,
    ) -> BillingResult<Vec<Membership>> {
        let state = lock(&self.state);
        Self::check_reads(&state)?;
        Ok(state
            .memberships
            .iter()
            .filter(|m| m.user_id == user_id && m.product_id == product_id && m.is_active())
            .cloned()
            .collect())
    }

    async fn get_membership(&self, membership_id: &str) -> BillingResult<Option<Membership>> {
        let state = lock(&self.state);
        Self::check_reads(&state)?;
        Ok(state
            .memberships
            .iter()
            .find(|m| m.id == membership_id)
            .cloned())
    }

    async fn cancel_membership(
        &self,
        _company_id: &str,
        membership_id: &str,
        timing: CancellationTiming,
    ) -> bool {
        let mut state = lock(&self.state);
        state
            .cancel_calls
            .push((membership_id.to_string(), timing));

        if state.failing_cancels.contains(membership_id) {
            return false;
        }

        match state.memberships.iter_mut().find(|m| m.id == membership_id) {
            Some(membership) => {
                if timing.is_immediate() {
                    membership.status = "canceled".to_string();
                } else {
                    membership.cancel_at_period_end = true;
                }
                true
            }
            None => false,
        }
    }
}
