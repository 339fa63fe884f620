//! Per-product automation policy
//!
//! A policy row is keyed by `(company_id, product_id)`. A missing row means the
//! operator never opted the product in, and reconciliation treats it exactly
//! like a disabled policy: nothing is canceled.

use async_trait::async_trait;
use serde::Deserialize;
use sqlx::PgPool;
use upshift_shared::CancellationTiming;

use crate::error::BillingResult;
use crate::models::ProductConfig;

/// Values written by the policy editor
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PolicyUpdate {
    pub company_id: String,
    pub product_id: String,
    pub enabled: bool,
    pub ignore_free_plans: bool,
    pub treat_same_price_as_upgrade: bool,
    pub allow_downgrade_to_cancel: bool,
    pub cancellation_timing: CancellationTiming,
}

/// Persistence of [`ProductConfig`] rows
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn get(&self, company_id: &str, product_id: &str) -> BillingResult<Option<ProductConfig>>;

    async fn upsert(&self, update: &PolicyUpdate) -> BillingResult<ProductConfig>;

    /// Product ids with a saved policy
    async fn list_configured_products(&self, company_id: &str) -> BillingResult<Vec<String>>;
}

/// How a stored policy applies to a reconciliation attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyResolution {
    Active(ProductConfig),
    Disabled(ProductConfig),
    NotConfigured,
}

impl PolicyResolution {
    /// Reason recorded in the activity log when the batch is skipped
    pub fn skip_reason(&self) -> Option<&'static str> {
        match self {
            PolicyResolution::Active(_) => None,
            PolicyResolution::Disabled(_) => Some("Upgrade protection disabled"),
            PolicyResolution::NotConfigured => Some("Product not configured"),
        }
    }
}

/// Look up the policy for a pair and classify it
pub async fn resolve_policy(
    store: &dyn PolicyStore,
    company_id: &str,
    product_id: &str,
) -> BillingResult<PolicyResolution> {
    Ok(match store.get(company_id, product_id).await? {
        Some(config) if config.enabled => PolicyResolution::Active(config),
        Some(config) => PolicyResolution::Disabled(config),
        None => PolicyResolution::NotConfigured,
    })
}

/// Postgres-backed [`PolicyStore`]
#[derive(Clone)]
pub struct PgPolicyStore {
    pool: PgPool,
}

impl PgPolicyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PolicyStore for PgPolicyStore {
    async fn get(&self, company_id: &str, product_id: &str) -> BillingResult<Option<ProductConfig>> {
        let config: Option<ProductConfig> = sqlx::query_as(
            r#"
            SELECT company_id, product_id, enabled, ignore_free_plans,
                   treat_same_price_as_upgrade, allow_downgrade_to_cancel,
                   cancellation_timing, created_at, updated_at
            FROM product_configs
            WHERE company_id = $1 AND product_id = $2
            "#,
        )
        .bind(company_id)
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                company_id = %company_id,
                product_id = %product_id,
                error = %e,
                "Failed to read product config"
            );
            e
        })?;

        Ok(config)
    }

    async fn upsert(&self, update: &PolicyUpdate) -> BillingResult<ProductConfig> {
        let config: ProductConfig = sqlx::query_as(
            r#"
            INSERT INTO product_configs
                (company_id, product_id, enabled, ignore_free_plans,
                 treat_same_price_as_upgrade, allow_downgrade_to_cancel, cancellation_timing)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (company_id, product_id) DO UPDATE SET
                enabled = EXCLUDED.enabled,
                ignore_free_plans = EXCLUDED.ignore_free_plans,
                treat_same_price_as_upgrade = EXCLUDED.treat_same_price_as_upgrade,
                allow_downgrade_to_cancel = EXCLUDED.allow_downgrade_to_cancel,
                cancellation_timing = EXCLUDED.cancellation_timing,
                updated_at = NOW()
            RETURNING company_id, product_id, enabled, ignore_free_plans,
                      treat_same_price_as_upgrade, allow_downgrade_to_cancel,
                      cancellation_timing, created_at, updated_at
            "#,
        )
        .bind(&update.company_id)
        .bind(&update.product_id)
        .bind(update.enabled)
        .bind(update.ignore_free_plans)
        .bind(update.treat_same_price_as_upgrade)
        .bind(update.allow_downgrade_to_cancel)
        .bind(update.cancellation_timing.as_str())
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            company_id = %config.company_id,
            product_id = %config.product_id,
            enabled = config.enabled,
            "Product config saved"
        );

        Ok(config)
    }

    async fn list_configured_products(&self, company_id: &str) -> BillingResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT product_id FROM product_configs WHERE company_id = $1 ORDER BY product_id",
        )
        .bind(company_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
