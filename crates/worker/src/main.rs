#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Upshift Background Worker
//!
//! Handles scheduled jobs:
//! - Reconciliation failure alerting from the activity log (every 5 minutes)
//! - Database heartbeat (every 5 minutes)

mod alerting;

use std::sync::Arc;

use anyhow::Context;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};
use upshift_billing::PgAuditStore;
use upshift_shared::create_pool;

use crate::alerting::{AlertConfig, AlertOutcome, FailureAlerter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    let subscriber = tracing_subscriber::fmt().with_env_filter(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    );
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Starting Upshift Worker");

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let pool = create_pool(&database_url).await?;
    info!("Database pool created");

    let alert_config = AlertConfig::from_env()?;
    if alert_config.webhook_url.is_none() {
        warn!("ALERT_WEBHOOK_URL not set - failure alerts are logged only");
    }
    let alerter = Arc::new(FailureAlerter::new(
        Arc::new(PgAuditStore::new(pool.clone())),
        alert_config,
    ));
    info!(
        threshold = alerter.config().error_threshold,
        window_secs = alerter.config().window.as_secs(),
        "Failure alerting configured"
    );

    let mut scheduler = JobScheduler::new().await?;

    // Job 1: Reconciliation failure alerting
    scheduler
        .add(Job::new_async("0 */5 * * * *", move |_uuid, _l| {
            let alerter = alerter.clone();
            Box::pin(async move {
                match alerter.check(OffsetDateTime::now_utc()).await {
                    Ok(AlertOutcome::Quiet { errors }) => {
                        debug!(errors = errors, "Failure alert check: below threshold");
                    }
                    Ok(AlertOutcome::Raised { errors, delivered }) => {
                        info!(errors = errors, delivered = delivered, "Failure alert raised");
                    }
                    Err(e) => error!(error = %e, "Failure alert check failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Failure alerting (every 5 minutes)");

    // Job 2: Database heartbeat
    let heartbeat_pool = pool.clone();
    scheduler
        .add(Job::new_async("30 */5 * * * *", move |_uuid, _l| {
            let pool = heartbeat_pool.clone();
            Box::pin(async move {
                match sqlx::query("SELECT 1").execute(&pool).await {
                    Ok(_) => info!("Worker heartbeat"),
                    Err(e) => error!(error = %e, "Worker heartbeat failed: database unreachable"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Database heartbeat (every 5 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("Upshift Worker started successfully with {} scheduled jobs", 2);

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping scheduler");
    scheduler.shutdown().await?;
    pool.close().await;

    Ok(())
}
