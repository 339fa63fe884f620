//! Router tests against in-memory collaborators

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tower::ServiceExt;
use upshift_billing::memory::{InMemoryAuditStore, InMemoryBilling, InMemoryPolicyStore};
use upshift_billing::{
    AllowAll, AuditLogger, BillingApiClient, BillingConfig, Entitlement, EntitlementChecker,
    Membership, Plan, PolicyStore, PolicyUpdate, Product, QueueConfig, QueueStats,
    QueueSupervisor, ReconciliationQueue, ReconciliationService, UpgradeExecutor,
};
use upshift_shared::{ActivityStatus, CancellationTiming, PlanType};

use super::access::UserTokenClaims;
use super::create_router;
use crate::config::Config;
use crate::state::AppState;

struct DenyAll;

#[async_trait]
impl EntitlementChecker for DenyAll {
    async fn check(&self, _user_id: &str) -> Entitlement {
        Entitlement::denied()
    }
}

struct TestApp {
    router: Router,
    billing: Arc<InMemoryBilling>,
    policies: Arc<InMemoryPolicyStore>,
    audit: Arc<InMemoryAuditStore>,
    queue: ReconciliationQueue,
    supervisor: Option<QueueSupervisor>,
}

impl TestApp {
    fn new(config: Config, entitlement: Arc<dyn EntitlementChecker>) -> Self {
        let billing = Arc::new(InMemoryBilling::new());
        let policies = Arc::new(InMemoryPolicyStore::new());
        let audit = Arc::new(InMemoryAuditStore::new());

        let executor = UpgradeExecutor::new(
            billing.clone(),
            policies.clone(),
            AuditLogger::new(audit.clone()),
        );
        let supervisor = QueueSupervisor::start(Arc::new(executor), QueueConfig::default());

        let state = AppState::from_parts(
            config,
            billing.clone(),
            policies.clone(),
            audit.clone(),
            entitlement,
            supervisor.queue(),
        );

        Self {
            router: create_router(state),
            billing,
            policies,
            audit,
            queue: supervisor.queue(),
            supervisor: Some(supervisor),
        }
    }

    /// Stop the queue and wait for every accepted job
    async fn drain(&mut self) -> QueueStats {
        self.supervisor
            .take()
            .unwrap()
            .shutdown(Duration::from_secs(5))
            .await
    }

    fn allow_all() -> Self {
        Self::new(Config::default(), Arc::new(AllowAll))
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Vec<u8>) {
        let response: Response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    async fn get_json(&self, uri: &str) -> (StatusCode, Value) {
        let (status, body) = self
            .send(Request::get(uri).body(Body::empty()).unwrap())
            .await;
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    async fn post_webhook(&self, body: &Value) -> StatusCode {
        let request = Request::post("/api/webhooks/membership-activated")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(request).await.0
    }

    async fn enable_policy(&self) {
        self.policies
            .upsert(&PolicyUpdate {
                company_id: "biz_1".into(),
                product_id: "prod_1".into(),
                enabled: true,
                ignore_free_plans: false,
                treat_same_price_as_upgrade: false,
                allow_downgrade_to_cancel: false,
                cancellation_timing: CancellationTiming::PeriodEnd,
            })
            .await
            .unwrap();
    }

    fn seed_upgrade(&self) {
        for (id, cents) in [("plan_basic", 1000), ("plan_pro", 2000)] {
            self.billing.add_plan(Plan {
                id: id.into(),
                title: id.into(),
                product_id: "prod_1".into(),
                plan_type: PlanType::Renewal,
                initial_price_cents: 0,
                renewal_price_cents: cents,
            });
        }
        for (id, plan) in [("mem_old", "plan_basic"), ("mem_new", "plan_pro")] {
            self.billing.add_membership(Membership {
                id: id.into(),
                user_id: "user_1".into(),
                product_id: "prod_1".into(),
                plan_id: plan.into(),
                status: "active".into(),
                canceled_at: None,
                cancel_at_period_end: false,
            });
        }
    }
}

fn activated_event() -> Value {
    json!({
        "type": "membership.activated",
        "data": {
            "membership": {"id": "mem_new", "company_id": "biz_1"},
            "user": {"id": "user_1"},
            "product": {"id": "prod_1"},
            "plan": {"id": "plan_pro"}
        }
    })
}

#[tokio::test]
async fn test_webhook_queues_reconciliation_and_acknowledges() {
    let mut app = TestApp::allow_all();
    app.seed_upgrade();
    app.enable_policy().await;

    assert_eq!(app.post_webhook(&activated_event()).await, StatusCode::OK);

    let stats = app.drain().await;
    assert_eq!(stats.enqueued, 1);
    assert_eq!(stats.completed, 1);
    assert_eq!(app.audit.statuses(), vec![ActivityStatus::Canceled]);
    assert_eq!(
        app.billing.membership("mem_old").map(|m| m.cancel_at_period_end),
        Some(true)
    );
}

#[tokio::test]
async fn test_malformed_webhooks_are_rejected() {
    let app = TestApp::allow_all();

    let request = Request::post("/api/webhooks/membership-activated")
        .body(Body::from("{not json"))
        .unwrap();
    assert_eq!(app.send(request).await.0, StatusCode::BAD_REQUEST);

    let mut missing_plan = activated_event();
    missing_plan["data"]
        .as_object_mut()
        .unwrap()
        .remove("plan");
    assert_eq!(app.post_webhook(&missing_plan).await, StatusCode::BAD_REQUEST);

    let mut missing_company = activated_event();
    missing_company["data"]["membership"] = json!({"id": "mem_new"});
    assert_eq!(
        app.post_webhook(&missing_company).await,
        StatusCode::BAD_REQUEST
    );

    assert_eq!(app.queue.stats().enqueued, 0);
}

#[tokio::test]
async fn test_other_events_are_acknowledged_without_work() {
    let app = TestApp::allow_all();

    let status = app
        .post_webhook(&json!({"type": "payment.succeeded", "data": {"id": "pay_1"}}))
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(app.queue.stats().enqueued, 0);
}

#[tokio::test]
async fn test_unentitled_user_is_skipped_silently() {
    let mut app = TestApp::new(Config::default(), Arc::new(DenyAll));
    app.seed_upgrade();
    app.enable_policy().await;

    assert_eq!(app.post_webhook(&activated_event()).await, StatusCode::OK);

    let stats = app.drain().await;
    assert_eq!(stats.enqueued, 0);
    assert!(app.audit.entries().is_empty());
    assert!(app.billing.cancel_calls().is_empty());
}

#[tokio::test]
async fn test_entitlement_outage_is_acknowledged_after_one_upstream_call() {
    let mut server = mockito::Server::new_async().await;
    let memberships = server
        .mock("GET", "/memberships")
        .match_query(mockito::Matcher::Any)
        .with_status(503)
        .expect(1)
        .create_async()
        .await;

    // Production client defaults, retries included
    let client = BillingApiClient::new(BillingConfig::new("test_key", server.url())).unwrap();
    let service = ReconciliationService::with_client(
        client,
        Arc::new(InMemoryPolicyStore::new()),
        Arc::new(InMemoryAuditStore::new()),
    )
    .unwrap();
    let supervisor =
        QueueSupervisor::start(Arc::new(service.executor.clone()), QueueConfig::default());
    let config = Config {
        gating_company_id: "biz_operator".into(),
        gating_product_id: "prod_gate".into(),
        ..Config::default()
    };
    let router = create_router(AppState::new(config, &service, supervisor.queue()));

    let request = Request::post("/api/webhooks/membership-activated")
        .header("content-type", "application/json")
        .body(Body::from(activated_event().to_string()))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    memberships.assert_async().await;
    assert_eq!(supervisor.queue().stats().enqueued, 0);
}

#[tokio::test]
async fn test_webhook_signature_is_enforced_when_configured() {
    let key = b"webhook-key";
    let config = Config {
        webhook_secret: Some(String::from_utf8_lossy(key).into_owned()),
        ..Config::default()
    };
    let app = TestApp::new(config, Arc::new(AllowAll));
    let body = activated_event().to_string();

    assert_eq!(
        app.send(
            Request::post("/api/webhooks/membership-activated")
                .body(Body::from(body.clone()))
                .unwrap()
        )
        .await
        .0,
        StatusCode::UNAUTHORIZED
    );

    let now = OffsetDateTime::now_utc().unix_timestamp();
    let signature = upshift_billing::webhooks::sign(key, "msg_1", now, body.as_bytes()).unwrap();
    let signed = Request::post("/api/webhooks/membership-activated")
        .header("webhook-id", "msg_1")
        .header("webhook-timestamp", now.to_string())
        .header("webhook-signature", signature.clone())
        .body(Body::from(body.clone()))
        .unwrap();
    assert_eq!(app.send(signed).await.0, StatusCode::OK);

    let extreme = Request::post("/api/webhooks/membership-activated")
        .header("webhook-id", "msg_1")
        .header("webhook-timestamp", i64::MIN.to_string())
        .header("webhook-signature", signature)
        .body(Body::from(body))
        .unwrap();
    assert_eq!(app.send(extreme).await.0, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_rules_read_defaults_then_save() {
    let app = TestApp::allow_all();

    let (status, body) = app
        .get_json("/api/rules?companyId=biz_1&productId=prod_1")
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({
            "enabled": false,
            "configured": false,
            "cancellationTiming": "period_end",
            "advancedRules": {
                "ignoreFreePlans": false,
                "treatSamePriceAsUpgrade": false,
                "allowDowngradeToCancel": false
            }
        })
    );

    let save = Request::post("/api/rules")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "companyId": "biz_1",
                "productId": "prod_1",
                "advancedRules": {"ignoreFreePlans": true}
            })
            .to_string(),
        ))
        .unwrap();
    let (status, _) = app.send(save).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = app
        .get_json("/api/rules?companyId=biz_1&productId=prod_1")
        .await;
    assert_eq!(body["enabled"], json!(true));
    assert_eq!(body["configured"], json!(true));
    assert_eq!(body["advancedRules"]["ignoreFreePlans"], json!(true));

    let (_, configs) = app.get_json("/api/configs?companyId=biz_1").await;
    assert_eq!(configs, json!({"configuredProductIds": ["prod_1"]}));
}

#[tokio::test]
async fn test_missing_query_parameters_are_bad_requests() {
    let app = TestApp::allow_all();

    for uri in [
        "/api/rules?companyId=biz_1",
        "/api/configs",
        "/api/activity",
        "/api/plans?productId=prod_1",
        "/api/products",
    ] {
        let (status, body) = app.get_json(uri).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
        assert!(body["error"].is_string(), "{uri}");
    }
}

#[tokio::test]
async fn test_store_outage_is_a_server_error() {
    let app = TestApp::allow_all();
    app.policies.set_unavailable(true);

    let (status, body) = app
        .get_json("/api/rules?companyId=biz_1&productId=prod_1")
        .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], json!("Internal server error"));
}

#[tokio::test]
async fn test_activity_is_newest_first_and_limited() {
    let mut app = TestApp::allow_all();
    app.seed_upgrade();
    app.enable_policy().await;

    // Two deliveries: one cancel, then nothing left to match
    app.post_webhook(&activated_event()).await;
    app.post_webhook(&activated_event()).await;
    app.drain().await;

    let (status, body) = app.get_json("/api/activity?companyId=biz_1&limit=1").await;
    assert_eq!(status, StatusCode::OK);
    let activities = body["activities"].as_array().unwrap();
    assert_eq!(activities.len(), 1);
    assert!(activities[0]["created_at"].is_string());

    let (_, all) = app.get_json("/api/activity?companyId=biz_1").await;
    assert_eq!(all["activities"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_products_include_plan_counts() {
    let app = TestApp::allow_all();
    app.seed_upgrade();
    app.billing.add_product(Product {
        id: "prod_1".into(),
        title: "Course".into(),
        company_id: "biz_1".into(),
    });
    app.billing.add_product(Product {
        id: "prod_2".into(),
        title: "Empty".into(),
        company_id: "biz_1".into(),
    });

    let (status, body) = app.get_json("/api/products?companyId=biz_1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({"products": [
            {"id": "prod_1", "title": "Course", "planCount": 2},
            {"id": "prod_2", "title": "Empty", "planCount": 0}
        ]})
    );

    let (status, plans) = app
        .get_json("/api/plans?companyId=biz_1&productId=prod_1")
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(plans["plans"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_upstream_failure_is_bad_gateway() {
    let app = TestApp::allow_all();
    app.billing.set_reads_failing(true);

    let (status, _) = app.get_json("/api/products?companyId=biz_1").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_access_check_requires_valid_token() {
    let secret = "user-token-secret";
    let config = Config {
        user_token_secret: Some(secret.into()),
        ..Config::default()
    };
    let app = TestApp::new(config, Arc::new(AllowAll));

    let (status, body) = app.get_json("/api/access/check").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["hasAccess"], json!(false));

    let bad = Request::get("/api/access/check")
        .header("x-user-token", "not-a-jwt")
        .body(Body::empty())
        .unwrap();
    assert_eq!(app.send(bad).await.0, StatusCode::UNAUTHORIZED);

    let claims = UserTokenClaims {
        sub: "user_1".into(),
        exp: (OffsetDateTime::now_utc().unix_timestamp() + 3600) as usize,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap();
    let good = Request::get("/api/access/check")
        .header("x-user-token", token)
        .body(Body::empty())
        .unwrap();
    let (status, body) = app.send(good).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body, json!({"hasAccess": true, "accessLevel": "customer"}));
}

#[tokio::test]
async fn test_health_reports_queue_counters() {
    let app = TestApp::allow_all();

    let (status, body) = app.get_json("/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("ok"));
    assert_eq!(body["queue"]["enqueued"], json!(0));
}
