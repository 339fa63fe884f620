//! Product and plan listing, read through from the billing platform

use axum::extract::{Query, State};
use axum::Json;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use upshift_billing::Plan;

use crate::error::{ApiError, ApiResult};
use crate::routes::CompanyQuery;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlansQuery {
    pub company_id: Option<String>,
    pub product_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PlansResponse {
    pub plans: Vec<Plan>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductSummary {
    pub id: String,
    pub title: String,
    pub plan_count: usize,
}

#[derive(Debug, Serialize)]
pub struct ProductsResponse {
    pub products: Vec<ProductSummary>,
}

/// GET /api/plans?companyId&productId
pub async fn list_plans(
    State(state): State<AppState>,
    Query(query): Query<PlansQuery>,
) -> ApiResult<Json<PlansResponse>> {
    let (Some(company_id), Some(product_id)) = (query.company_id, query.product_id) else {
        return Err(ApiError::Validation(
            "companyId and productId are required".into(),
        ));
    };

    let plans = state.billing.list_plans(&company_id, &product_id).await?;

    Ok(Json(PlansResponse { plans }))
}

/// GET /api/products?companyId
///
/// A product whose plans cannot be listed is reported with zero plans.
pub async fn list_products(
    State(state): State<AppState>,
    Query(query): Query<CompanyQuery>,
) -> ApiResult<Json<ProductsResponse>> {
    let company_id = query
        .company_id
        .ok_or_else(|| ApiError::Validation("companyId is required".into()))?;

    let products = state.billing.list_products(&company_id).await?;

    let counts = join_all(products.iter().map(|product| {
        let billing = state.billing.clone();
        let company_id = company_id.clone();
        let product_id = product.id.clone();
        async move {
            match billing.list_plans(&company_id, &product_id).await {
                Ok(plans) => plans.len(),
                Err(e) => {
                    tracing::warn!(
                        product_id = %product_id,
                        error = %e,
                        "Failed to count plans"
                    );
                    0
                }
            }
        }
    }))
    .await;

    let products = products
        .into_iter()
        .zip(counts)
        .map(|(product, plan_count)| ProductSummary {
            id: product.id,
            title: product.title,
            plan_count,
        })
        .collect();

    Ok(Json(ProductsResponse { products }))
}
