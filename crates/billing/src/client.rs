//! Billing platform API client
//!
//! Typed facade over the platform's v1 REST API. List calls follow cursor
//! pagination up to a fixed page budget; every call has a timeout and transient
//! failures are retried with exponential backoff.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde_json::Value;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use upshift_shared::CancellationTiming;

use crate::error::{BillingError, BillingResult};
use crate::mapping;
use crate::models::{Membership, Plan, Product};

pub const DEFAULT_BASE_URL: &str = "https://api.whop.com/api/v1";

/// Membership statuses that still grant access
pub const ACTIVE_STATUSES: [&str; 2] = ["active", "trialing"];

/// Billing API configuration
#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub api_key: String,
    pub base_url: String,
    /// Per-request timeout, applied to every attempt
    pub timeout: Duration,
    /// Extra attempts after a transient failure
    pub max_retries: usize,
    /// Upper bound on pages fetched by a single list call
    pub max_pages: usize,
}

impl BillingConfig {
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: base_url.into(),
            timeout: Duration::from_secs(10),
            max_retries: 2,
            max_pages: 50,
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let api_key = std::env::var("BILLING_API_KEY")
            .ok()
            .filter(|k| !k.is_empty() && k != "fallback")
            .ok_or_else(|| BillingError::Config("BILLING_API_KEY is not set".to_string()))?;

        let base_url =
            std::env::var("BILLING_API_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());

        let mut config = Self::new(api_key, base_url);
        config.timeout = Duration::from_secs(env_parse("BILLING_API_TIMEOUT_SECS", 10)?);
        config.max_retries = env_parse("BILLING_API_MAX_RETRIES", 2)?;
        config.max_pages = env_parse("BILLING_API_MAX_PAGES", 50)?;

        if config.max_pages == 0 {
            return Err(BillingError::Config(
                "BILLING_API_MAX_PAGES must be at least 1".to_string(),
            ));
        }

        Ok(config)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> BillingResult<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| BillingError::Config(format!("{} has an invalid value: {}", key, raw))),
        Err(_) => Ok(default),
    }
}

/// Operations the reconciliation core needs from the billing platform
#[async_trait]
pub trait BillingApi: Send + Sync {
    /// Regular products owned by a company
    async fn list_products(&self, company_id: &str) -> BillingResult<Vec<Product>>;

    /// Every plan of a product
    async fn list_plans(&self, company_id: &str, product_id: &str) -> BillingResult<Vec<Plan>>;

    /// One plan, `None` when the platform does not know the id
    async fn get_plan(&self, plan_id: &str) -> BillingResult<Option<Plan>>;

    /// Active and trialing memberships of a user to a product
    async fn list_active_memberships(
        &self,
        company_id: &str,
        user_id: &str,
        product_id: &str,
    ) -> BillingResult<Vec<Membership>>;

    /// One membership, `None` when the platform does not know the id
    async fn get_membership(&self, membership_id: &str) -> BillingResult<Option<Membership>>;

    /// Request cancellation of a membership
    ///
    /// Never fails: returns `false` when the platform refused or could not be
    /// reached, so a batch of cancellations is not cut short by one failure.
    /// Canceling a membership that is already canceled returns `true`.
    async fn cancel_membership(
        &self,
        company_id: &str,
        membership_id: &str,
        timing: CancellationTiming,
    ) -> bool;
}

/// reqwest-backed [`BillingApi`]
#[derive(Clone)]
pub struct BillingApiClient {
    http: Client,
    config: BillingConfig,
}

impl BillingApiClient {
    pub fn new(config: BillingConfig) -> BillingResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BillingError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { http, config })
    }

    pub fn from_env() -> BillingResult<Self> {
        Self::new(BillingConfig::from_env()?)
    }

    pub fn config(&self) -> &BillingConfig {
        &self.config
    }

    /// Copy of this client for request paths that must answer quickly: a
    /// single attempt, bounded by `timeout` or the configured timeout if shorter.
    pub fn fail_fast(&self, timeout: Duration) -> BillingResult<Self> {
        let mut config = self.config.clone();
        config.max_retries = 0;
        config.timeout = config.timeout.min(timeout);
        Self::new(config)
    }

    fn url(&self, segments: &[&str]) -> BillingResult<Url> {
        let mut url = Url::parse(&self.config.base_url)
            .map_err(|e| BillingError::Config(format!("Invalid billing API base URL: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| BillingError::Config("Billing API base URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// One HTTP attempt; non-success statuses become `UpstreamApi` errors
    async fn request_once(
        &self,
        method: Method,
        url: Url,
        query: &[(String, String)],
    ) -> BillingResult<Value> {
        let response = self
            .http
            .request(method, url)
            .bearer_auth(&self.config.api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BillingError::UpstreamApi {
                status: status.as_u16(),
                body,
            });
        }

        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| BillingError::Decode(e.to_string()))
    }

    /// Issue a request, retrying transient failures
    async fn request(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(String, String)],
    ) -> BillingResult<Value> {
        let url = self.url(segments)?;
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(50)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(self.config.max_retries);

        RetryIf::start(
            strategy,
            || {
                let method = method.clone();
                let url = url.clone();
                async move {
                    let result = self.request_once(method, url, query).await;
                    if let Err(e) = &result {
                        if e.is_transient() {
                            tracing::warn!(
                                path = %segments.join("/"),
                                error = %e,
                                "Transient billing API failure"
                            );
                        }
                    }
                    result
                }
            },
            |e: &BillingError| e.is_transient(),
        )
        .await
    }

    /// Follow cursor pagination, mapping every item
    async fn paginate<T>(
        &self,
        resource: &'static str,
        query: Vec<(String, String)>,
        map: fn(&Value) -> T,
    ) -> BillingResult<Vec<T>> {
        let mut items = Vec::new();
        let mut seen_cursors = HashSet::new();
        let mut after: Option<String> = None;

        for _ in 0..self.config.max_pages {
            let mut page_query = query.clone();
            if let Some(cursor) = &after {
                page_query.push(("after".to_string(), cursor.clone()));
            }

            let body = self.request(Method::GET, &[resource], &page_query).await?;
            let page = mapping::page_items(&body, resource);
            tracing::debug!(resource = resource, count = page.len(), "Fetched page");
            items.extend(page.iter().map(map));

            match mapping::next_cursor(&body) {
                None => return Ok(items),
                Some(cursor) => {
                    if !seen_cursors.insert(cursor.clone()) {
                        tracing::error!(
                            resource = resource,
                            cursor = %cursor,
                            "Billing API returned a repeated cursor"
                        );
                        return Err(BillingError::PaginationLimit {
                            resource,
                            max_pages: self.config.max_pages,
                        });
                    }
                    after = Some(cursor);
                }
            }
        }

        tracing::error!(
            resource = resource,
            max_pages = self.config.max_pages,
            "Pagination budget exhausted"
        );
        Err(BillingError::PaginationLimit {
            resource,
            max_pages: self.config.max_pages,
        })
    }

    /// List memberships matching the given filters
    pub async fn list_memberships(
        &self,
        company_id: &str,
        user_id: &str,
        product_id: &str,
        statuses: &[&str],
    ) -> BillingResult<Vec<Membership>> {
        let mut query = vec![
            ("company_id".to_string(), company_id.to_string()),
            ("user_ids[]".to_string(), user_id.to_string()),
            ("product_ids[]".to_string(), product_id.to_string()),
        ];
        query.extend(
            statuses
                .iter()
                .map(|s| ("statuses[]".to_string(), s.to_string())),
        );

        self.paginate("memberships", query, mapping::membership_from_upstream)
            .await
    }

    async fn fetch_optional(&self, segments: &[&str]) -> BillingResult<Option<Value>> {
        match self.request(Method::GET, segments, &[]).await {
            Ok(body) => Ok(Some(body)),
            Err(BillingError::UpstreamApi { status, .. })
                if status == StatusCode::NOT_FOUND.as_u16() =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl BillingApi for BillingApiClient {
    async fn list_products(&self, company_id: &str) -> BillingResult<Vec<Product>> {
        let query = vec![
            ("company_id".to_string(), company_id.to_string()),
            ("product_types[]".to_string(), "regular".to_string()),
        ];
        self.paginate("products", query, mapping::product_from_upstream)
            .await
    }

    async fn list_plans(&self, company_id: &str, product_id: &str) -> BillingResult<Vec<Plan>> {
        let query = vec![
            ("company_id".to_string(), company_id.to_string()),
            ("product_ids[]".to_string(), product_id.to_string()),
        ];
        self.paginate("plans", query, mapping::plan_from_upstream)
            .await
    }

    async fn get_plan(&self, plan_id: &str) -> BillingResult<Option<Plan>> {
        let plan = self.fetch_optional(&["plans", plan_id]).await?.map(|raw| {
            let mut plan = mapping::plan_from_upstream(&raw);
            if plan.id.is_empty() {
                plan.id = plan_id.to_string();
            }
            plan
        });

        if let Some(plan) = &plan {
            tracing::debug!(
                plan_id = %plan.id,
                title = %plan.title,
                plan_type = %plan.plan_type,
                initial_price_cents = plan.initial_price_cents,
                renewal_price_cents = plan.renewal_price_cents,
                "Fetched plan"
            );
        }

        Ok(plan)
    }

    async fn list_active_memberships(
        &self,
        company_id: &str,
        user_id: &str,
        product_id: &str,
    ) -> BillingResult<Vec<Membership>> {
        let memberships = self
            .list_memberships(company_id, user_id, product_id, &ACTIVE_STATUSES)
            .await?;

        // The filters are advisory on some API versions
        Ok(memberships
            .into_iter()
            .filter(|m| m.is_active() && m.product_id == product_id)
            .collect())
    }

    async fn get_membership(&self, membership_id: &str) -> BillingResult<Option<Membership>> {
        Ok(self
            .fetch_optional(&["memberships", membership_id])
            .await?
            .map(|raw| mapping::membership_from_upstream(&raw)))
    }

    async fn cancel_membership(
        &self,
        company_id: &str,
        membership_id: &str,
        timing: CancellationTiming,
    ) -> bool {
        let mut query = Vec::new();
        if timing.is_immediate() {
            query.push(("immediate".to_string(), "true".to_string()));
        }

        let error = match self
            .request(Method::POST, &["memberships", membership_id, "cancel"], &query)
            .await
        {
            Ok(_) => {
                tracing::info!(
                    company_id = %company_id,
                    membership_id = %membership_id,
                    timing = %timing,
                    "Membership canceled"
                );
                return true;
            }
            Err(e) => e,
        };

        // A concurrent delivery may have canceled it first
        match self.get_membership(membership_id).await {
            Ok(Some(m)) if already_canceled(&m, timing) => {
                tracing::info!(
                    membership_id = %membership_id,
                    status = %m.status,
                    "Membership was already canceled, treating cancel as success"
                );
                true
            }
            Ok(_) => {
                tracing::error!(
                    company_id = %company_id,
                    membership_id = %membership_id,
                    error = %error,
                    "Failed to cancel membership"
                );
                false
            }
            Err(lookup_err) => {
                tracing::error!(
                    company_id = %company_id,
                    membership_id = %membership_id,
                    error = %error,
                    lookup_error = %lookup_err,
                    "Failed to cancel membership and could not confirm its state"
                );
                false
            }
        }
    }
}

fn already_canceled(membership: &Membership, timing: CancellationTiming) -> bool {
    match timing {
        CancellationTiming::Immediate => !membership.is_active(),
        CancellationTiming::PeriodEnd => {
            !membership.is_active() || membership.is_canceled_or_canceling()
        }
    }
}
