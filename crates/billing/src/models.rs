//! Domain records read from the billing platform and the local stores

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use upshift_shared::{ActivityStatus, CancellationTiming, PlanType};
use uuid::Uuid;

/// A sellable offering grouping one or more plans
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Product {
    pub id: String,
    pub title: String,
    pub company_id: String,
}

/// A priced tier of a product
///
/// Prices are always integer cents. Upstream major-unit values are converted
/// once, in [`crate::mapping`], before a `Plan` exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub id: String,
    /// Human-readable label built from the plan name, product title and price
    pub title: String,
    pub product_id: String,
    pub plan_type: PlanType,
    pub initial_price_cents: i64,
    pub renewal_price_cents: i64,
}

impl Plan {
    /// Price used for tier comparison: the renewal price, or the initial price
    /// for plans that carry no renewal price.
    pub fn effective_price_cents(&self) -> i64 {
        if self.renewal_price_cents != 0 {
            self.renewal_price_cents
        } else {
            self.initial_price_cents
        }
    }

    pub fn terms(&self) -> PlanTerms {
        PlanTerms {
            plan_type: self.plan_type,
            price_cents: self.effective_price_cents(),
        }
    }
}

/// The two facts about a plan the decision engine looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanTerms {
    pub plan_type: PlanType,
    pub price_cents: i64,
}

/// A subscriber's instance of a plan. Owned by the billing platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Membership {
    pub id: String,
    pub user_id: String,
    pub product_id: String,
    pub plan_id: String,
    pub status: String,
    pub canceled_at: Option<String>,
    pub cancel_at_period_end: bool,
}

impl Membership {
    pub fn is_active(&self) -> bool {
        matches!(self.status.as_str(), "active" | "trialing")
    }

    /// Whether the membership already ended or is scheduled to end
    pub fn is_canceled_or_canceling(&self) -> bool {
        matches!(
            self.status.as_str(),
            "canceled" | "cancelled" | "expired" | "completed"
        ) || self.cancel_at_period_end
    }
}

/// Per-(company, product) automation policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProductConfig {
    pub company_id: String,
    pub product_id: String,
    pub enabled: bool,
    pub ignore_free_plans: bool,
    pub treat_same_price_as_upgrade: bool,
    pub allow_downgrade_to_cancel: bool,
    #[sqlx(try_from = "String")]
    pub cancellation_timing: CancellationTiming,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub created_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option", default)]
    pub updated_at: Option<OffsetDateTime>,
}

impl ProductConfig {
    /// Policy used when no row exists for the pair. Reconciliation never runs
    /// against it because `enabled` is false.
    pub fn unconfigured(company_id: &str, product_id: &str) -> Self {
        Self {
            company_id: company_id.to_string(),
            product_id: product_id.to_string(),
            enabled: false,
            ignore_free_plans: false,
            treat_same_price_as_upgrade: false,
            allow_downgrade_to_cancel: false,
            cancellation_timing: CancellationTiming::PeriodEnd,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn flags(&self) -> PolicyFlags {
        PolicyFlags {
            ignore_free_plans: self.ignore_free_plans,
            treat_same_price_as_upgrade: self.treat_same_price_as_upgrade,
            allow_downgrade_to_cancel: self.allow_downgrade_to_cancel,
        }
    }
}

/// Decision-relevant subset of [`ProductConfig`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PolicyFlags {
    pub ignore_free_plans: bool,
    pub treat_same_price_as_upgrade: bool,
    pub allow_downgrade_to_cancel: bool,
}

/// Stored reconciliation outcome
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ActivityLog {
    pub id: Uuid,
    pub company_id: String,
    pub user_id: String,
    pub product_id: String,
    pub old_plan_id: Option<String>,
    pub new_plan_id: String,
    pub old_plan_name: Option<String>,
    pub new_plan_name: String,
    #[sqlx(try_from = "String")]
    pub status: ActivityStatus,
    pub error_message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Outcome to append to the activity log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewActivityLog {
    pub company_id: String,
    pub user_id: String,
    pub product_id: String,
    pub old_plan_id: Option<String>,
    pub new_plan_id: String,
    pub old_plan_name: Option<String>,
    pub new_plan_name: String,
    pub status: ActivityStatus,
    pub error_message: Option<String>,
}
