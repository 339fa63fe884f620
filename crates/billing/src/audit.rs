//! Reconciliation audit trail
//!
//! One append-only `activity_logs` row per terminal outcome. Rows are never
//! updated or deleted. Writing an entry must not fail the reconciliation it
//! describes, so [`AuditLogger::record`] swallows store errors after logging them.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use upshift_shared::ActivityStatus;

use crate::error::BillingResult;
use crate::models::{ActivityLog, NewActivityLog};

/// Persistence of [`ActivityLog`] rows
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn insert(&self, entry: &NewActivityLog) -> BillingResult<()>;

    /// Most recent rows of a company, newest first
    async fn recent(&self, company_id: &str, limit: i64) -> BillingResult<Vec<ActivityLog>>;

    /// Rows with the given status created at or after `since`
    async fn count_since(&self, status: ActivityStatus, since: OffsetDateTime)
        -> BillingResult<i64>;
}

/// Fields shared by every entry of one reconciliation attempt
#[derive(Debug, Clone)]
pub struct ActivityContext {
    pub company_id: String,
    pub user_id: String,
    pub product_id: String,
    pub new_plan_id: String,
    pub new_plan_name: String,
}

impl ActivityContext {
    fn entry(
        &self,
        status: ActivityStatus,
        old_plan_id: Option<&str>,
        old_plan_name: Option<&str>,
        error_message: Option<String>,
    ) -> NewActivityLog {
        NewActivityLog {
            company_id: self.company_id.clone(),
            user_id: self.user_id.clone(),
            product_id: self.product_id.clone(),
            old_plan_id: old_plan_id.map(str::to_string),
            new_plan_id: self.new_plan_id.clone(),
            old_plan_name: old_plan_name.map(str::to_string),
            new_plan_name: self.new_plan_name.clone(),
            status,
            error_message,
        }
    }

    pub fn skipped(&self, old_plan_id: Option<&str>, reason: &str) -> NewActivityLog {
        self.entry(
            ActivityStatus::Skipped,
            old_plan_id,
            None,
            Some(reason.to_string()),
        )
    }

    pub fn canceled(&self, old_plan_id: &str, old_plan_name: Option<&str>) -> NewActivityLog {
        self.entry(
            ActivityStatus::Canceled,
            Some(old_plan_id),
            old_plan_name,
            None,
        )
    }

    pub fn error(
        &self,
        old_plan_id: &str,
        old_plan_name: Option<&str>,
        message: String,
    ) -> NewActivityLog {
        self.entry(
            ActivityStatus::Error,
            Some(old_plan_id),
            old_plan_name,
            Some(message),
        )
    }
}

/// Infallible front for an [`AuditStore`]
#[derive(Clone)]
pub struct AuditLogger {
    store: Arc<dyn AuditStore>,
}

impl AuditLogger {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn AuditStore> {
        &self.store
    }

    /// Append an entry; failures are logged and otherwise ignored
    pub async fn record(&self, entry: NewActivityLog) {
        tracing::info!(
            company_id = %entry.company_id,
            user_id = %entry.user_id,
            product_id = %entry.product_id,
            status = %entry.status,
            old_plan = ?entry.old_plan_name.as_deref().or(entry.old_plan_id.as_deref()),
            new_plan = %entry.new_plan_name,
            reason = ?entry.error_message,
            "Recording reconciliation outcome"
        );

        if let Err(e) = self.store.insert(&entry).await {
            tracing::error!(
                company_id = %entry.company_id,
                user_id = %entry.user_id,
                status = %entry.status,
                error = %e,
                "Failed to write activity log entry"
            );
        }
    }
}

/// Postgres-backed [`AuditStore`]
#[derive(Clone)]
pub struct PgAuditStore {
    pool: PgPool,
}

impl PgAuditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn insert(&self, entry: &NewActivityLog) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO activity_logs
                (company_id, user_id, product_id, old_plan_id, new_plan_id,
                 old_plan_name, new_plan_name, status, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&entry.company_id)
        .bind(&entry.user_id)
        .bind(&entry.product_id)
        .bind(&entry.old_plan_id)
        .bind(&entry.new_plan_id)
        .bind(&entry.old_plan_name)
        .bind(&entry.new_plan_name)
        .bind(entry.status.as_str())
        .bind(&entry.error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recent(&self, company_id: &str, limit: i64) -> BillingResult<Vec<ActivityLog>> {
        let rows: Vec<ActivityLog> = sqlx::query_as(
            r#"
            SELECT id, company_id, user_id, product_id, old_plan_id, new_plan_id,
                   old_plan_name, new_plan_name, status, error_message, created_at
            FROM activity_logs
            WHERE company_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(company_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn count_since(
        &self,
        status: ActivityStatus,
        since: OffsetDateTime,
    ) -> BillingResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM activity_logs WHERE status = $1 AND created_at >= $2",
        )
        .bind(status.as_str())
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}
