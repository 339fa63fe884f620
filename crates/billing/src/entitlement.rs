//! Entitlement gate
//!
//! Decides whether a tenant may use the reconciliation service at all, by
//! looking for an active membership to the operator's own gating product.
//! Every failure answers "no access".

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::client::BillingApi;

/// Access level granted to any active customer of the gating product
pub const CUSTOMER_ACCESS_LEVEL: &str = "customer";

/// Upper bound on one entitlement check. The check sits on the webhook
/// acknowledgment path.
pub const ENTITLEMENT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entitlement {
    pub has_access: bool,
    pub access_level: Option<String>,
}

impl Entitlement {
    pub fn denied() -> Self {
        Self {
            has_access: false,
            access_level: None,
        }
    }

    pub fn customer() -> Self {
        Self {
            has_access: true,
            access_level: Some(CUSTOMER_ACCESS_LEVEL.to_string()),
        }
    }
}

#[async_trait]
pub trait EntitlementChecker: Send + Sync {
    /// Never fails; errors resolve to [`Entitlement::denied`]
    async fn check(&self, user_id: &str) -> Entitlement;
}

/// Checks membership of the gating product on the billing platform
pub struct EntitlementService {
    billing: Arc<dyn BillingApi>,
    company_id: String,
    product_id: String,
    timeout: Duration,
}

impl EntitlementService {
    pub fn new(
        billing: Arc<dyn BillingApi>,
        company_id: impl Into<String>,
        product_id: impl Into<String>,
    ) -> Self {
        Self {
            billing,
            company_id: company_id.into(),
            product_id: product_id.into(),
            timeout: ENTITLEMENT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl EntitlementChecker for EntitlementService {
    async fn check(&self, user_id: &str) -> Entitlement {
        if user_id.is_empty() || self.company_id.is_empty() || self.product_id.is_empty() {
            tracing::warn!(
                user_id = %user_id,
                "Entitlement check missing user or gating product, denying"
            );
            return Entitlement::denied();
        }

        let lookup = self
            .billing
            .list_active_memberships(&self.company_id, user_id, &self.product_id);

        let memberships = match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(memberships)) => memberships,
            Err(_) => {
                tracing::error!(
                    user_id = %user_id,
                    gating_product_id = %self.product_id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Entitlement lookup timed out, denying access"
                );
                return Entitlement::denied();
            }
            Ok(Err(e)) => {
                tracing::error!(
                    user_id = %user_id,
                    gating_product_id = %self.product_id,
                    error = %e,
                    "Entitlement lookup failed, denying access"
                );
                return Entitlement::denied();
            }
        };

        let active = memberships
            .iter()
            .filter(|m| m.is_active() && m.canceled_at.is_none() && m.product_id == self.product_id)
            .count();

        tracing::debug!(
            user_id = %user_id,
            gating_product_id = %self.product_id,
            active_memberships = active,
            "Entitlement checked"
        );

        if active > 0 {
            Entitlement::customer()
        } else {
            Entitlement::denied()
        }
    }
}

/// Gate used when the entitlement check is switched off
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl EntitlementChecker for AllowAll {
    async fn check(&self, _user_id: &str) -> Entitlement {
        Entitlement::customer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{BillingApiClient, BillingConfig};
    use mockito::Matcher;
    use serde_json::json;
    use std::time::Duration;

    fn service_for(server: &mockito::ServerGuard) -> EntitlementService {
        let mut config = BillingConfig::new("test_key", server.url());
        config.max_retries = 0;
        config.timeout = Duration::from_secs(5);
        let client = BillingApiClient::new(config).unwrap();
        EntitlementService::new(Arc::new(client), "biz_operator", "prod_gate")
    }

    #[tokio::test]
    async fn test_active_gating_membership_grants_access() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/memberships")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("company_id".into(), "biz_operator".into()),
                Matcher::UrlEncoded("user_ids[]".into(), "user_1".into()),
                Matcher::UrlEncoded("product_ids[]".into(), "prod_gate".into()),
            ]))
            .with_status(200)
            .with_body(
                json!({
                    "data": [{
                        "id": "mem_1",
                        "status": "active",
                        "user": {"id": "user_1"},
                        "product": {"id": "prod_gate"},
                        "plan": {"id": "plan_1"}
                    }],
                    "page_info": {"has_next_page": false}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let entitlement = service_for(&server).check("user_1").await;
        assert_eq!(entitlement, Entitlement::customer());
        assert_eq!(entitlement.access_level.as_deref(), Some("customer"));
    }

    #[tokio::test]
    async fn test_canceled_or_foreign_memberships_deny() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/memberships")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                json!({
                    "data": [
                        {
                            "id": "mem_1",
                            "status": "active",
                            "canceled_at": "2025-01-01T00:00:00Z",
                            "product": {"id": "prod_gate"},
                            "plan": {"id": "plan_1"}
                        },
                        {
                            "id": "mem_2",
                            "status": "active",
                            "product": {"id": "prod_other"},
                            "plan": {"id": "plan_2"}
                        }
                    ]
                })
                .to_string(),
            )
            .create_async()
            .await;

        assert_eq!(service_for(&server).check("user_1").await, Entitlement::denied());
    }

    #[tokio::test]
    async fn test_upstream_failure_fails_closed() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/memberships")
            .match_query(Matcher::Any)
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        assert_eq!(service_for(&server).check("user_1").await, Entitlement::denied());
    }

    #[tokio::test]
    async fn test_missing_gating_product_denies() {
        let server = mockito::Server::new_async().await;
        let mut config = BillingConfig::new("test_key", server.url());
        config.max_retries = 0;
        let client = BillingApiClient::new(config).unwrap();
        let service = EntitlementService::new(Arc::new(client), "biz_operator", "");

        assert!(!service.check("user_1").await.has_access);
    }

    #[tokio::test]
    async fn test_allow_all_grants_customer() {
        assert!(AllowAll.check("anyone").await.has_access);
    }

    #[test]
    fn test_entitlement_serializes_camel_case() {
        let body = serde_json::to_value(Entitlement::denied()).unwrap();
        assert_eq!(body, json!({"hasAccess": false, "accessLevel": null}));
    }

    #[tokio::test]
    async fn test_gate_over_production_client_calls_upstream_once() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/memberships")
            .match_query(Matcher::Any)
            .with_status(503)
            .expect(1)
            .create_async()
            .await;

        let client = BillingApiClient::new(BillingConfig::new("test_key", server.url())).unwrap();
        let gate_client = client.fail_fast(ENTITLEMENT_TIMEOUT).unwrap();
        let service = EntitlementService::new(Arc::new(gate_client), "biz_operator", "prod_gate");

        assert_eq!(service.check("user_1").await, Entitlement::denied());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_slow_platform_is_denied_within_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let client =
            BillingApiClient::new(BillingConfig::new("test_key", format!("http://{}", addr)))
                .unwrap();
        let service = EntitlementService::new(Arc::new(client), "biz_operator", "prod_gate")
            .with_timeout(Duration::from_millis(100));

        let started = std::time::Instant::now();
        assert_eq!(service.check("user_1").await, Entitlement::denied());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
