//! Audit log and saved configuration listings

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use upshift_billing::ActivityLog;

use crate::error::{ApiError, ApiResult};
use crate::routes::CompanyQuery;
use crate::state::AppState;

const DEFAULT_LIMIT: i64 = 5;
const MAX_LIMIT: i64 = 100;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityQuery {
    pub company_id: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ActivityResponse {
    pub activities: Vec<ActivityLog>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigsResponse {
    pub configured_product_ids: Vec<String>,
}

/// GET /api/activity?companyId&limit
pub async fn list_activity(
    State(state): State<AppState>,
    Query(query): Query<ActivityQuery>,
) -> ApiResult<Json<ActivityResponse>> {
    let company_id = query
        .company_id
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| ApiError::Validation("companyId is required".into()))?;
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    let activities = state.audit.recent(&company_id, limit).await?;

    Ok(Json(ActivityResponse { activities }))
}

/// GET /api/configs?companyId
pub async fn list_configs(
    State(state): State<AppState>,
    Query(query): Query<CompanyQuery>,
) -> ApiResult<Json<ConfigsResponse>> {
    let company_id = query
        .company_id
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| ApiError::Validation("companyId is required".into()))?;

    let configured_product_ids = state.policies.list_configured_products(&company_id).await?;

    Ok(Json(ConfigsResponse {
        configured_product_ids,
    }))
}
