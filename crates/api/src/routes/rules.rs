//! Product policy editor routes

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use upshift_billing::{PolicyUpdate, ProductConfig};
use upshift_shared::CancellationTiming;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RulesQuery {
    pub company_id: Option<String>,
    pub product_id: Option<String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvancedRules {
    pub ignore_free_plans: bool,
    pub treat_same_price_as_upgrade: bool,
    pub allow_downgrade_to_cancel: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RulesResponse {
    pub enabled: bool,
    /// False when no policy was ever saved for the product
    pub configured: bool,
    pub cancellation_timing: CancellationTiming,
    pub advanced_rules: AdvancedRules,
}

impl RulesResponse {
    fn from_config(config: &ProductConfig, configured: bool) -> Self {
        Self {
            enabled: config.enabled,
            configured,
            cancellation_timing: config.cancellation_timing,
            advanced_rules: AdvancedRules {
                ignore_free_plans: config.ignore_free_plans,
                treat_same_price_as_upgrade: config.treat_same_price_as_upgrade,
                allow_downgrade_to_cancel: config.allow_downgrade_to_cancel,
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialAdvancedRules {
    pub ignore_free_plans: Option<bool>,
    pub treat_same_price_as_upgrade: Option<bool>,
    pub allow_downgrade_to_cancel: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveRulesRequest {
    pub company_id: Option<String>,
    pub product_id: Option<String>,
    pub enabled: Option<bool>,
    pub cancellation_timing: Option<CancellationTiming>,
    pub advanced_rules: Option<PartialAdvancedRules>,
}

#[derive(Debug, Serialize)]
pub struct SaveRulesResponse {
    pub success: bool,
    pub rules: RulesResponse,
}

fn required(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// GET /api/rules?companyId&productId
pub async fn get_rules(
    State(state): State<AppState>,
    Query(query): Query<RulesQuery>,
) -> ApiResult<Json<RulesResponse>> {
    let (Some(company_id), Some(product_id)) =
        (required(query.company_id), required(query.product_id))
    else {
        return Err(ApiError::Validation(
            "companyId and productId are required".into(),
        ));
    };

    let response = match state.policies.get(&company_id, &product_id).await? {
        Some(config) => RulesResponse::from_config(&config, true),
        None => RulesResponse::from_config(
            &ProductConfig::unconfigured(&company_id, &product_id),
            false,
        ),
    };

    Ok(Json(response))
}

/// POST /api/rules
///
/// Omitted fields take the unconfigured defaults, except `enabled` which
/// defaults to true: saving a policy opts the product in.
pub async fn save_rules(
    State(state): State<AppState>,
    Json(req): Json<SaveRulesRequest>,
) -> ApiResult<Json<SaveRulesResponse>> {
    let (Some(company_id), Some(product_id)) =
        (required(req.company_id), required(req.product_id))
    else {
        return Err(ApiError::Validation(
            "companyId and productId are required".into(),
        ));
    };

    let advanced = req.advanced_rules.unwrap_or_default();
    let update = PolicyUpdate {
        company_id,
        product_id,
        enabled: req.enabled.unwrap_or(true),
        ignore_free_plans: advanced.ignore_free_plans.unwrap_or(false),
        treat_same_price_as_upgrade: advanced.treat_same_price_as_upgrade.unwrap_or(false),
        allow_downgrade_to_cancel: advanced.allow_downgrade_to_cancel.unwrap_or(false),
        cancellation_timing: req.cancellation_timing.unwrap_or_default(),
    };

    let config = state.policies.upsert(&update).await?;

    tracing::info!(
        company_id = %config.company_id,
        product_id = %config.product_id,
        enabled = config.enabled,
        timing = %config.cancellation_timing,
        "Rules saved"
    );

    Ok(Json(SaveRulesResponse {
        success: true,
        rules: RulesResponse::from_config(&config, true),
    }))
}
