//! Reconciliation failure alerting
//!
//! Webhooks are acknowledged before reconciliation runs, so a failed
//! cancellation only shows up as an `error` row in the activity log. This job
//! counts those rows over a sliding window and raises an alert at the
//! configured threshold.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing::error;
use upshift_billing::{AuditStore, BillingResult};
use upshift_shared::ActivityStatus;

const ALERT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct AlertConfig {
    /// Slack-compatible incoming webhook
    pub webhook_url: Option<String>,
    pub error_threshold: i64,
    pub window: Duration,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            error_threshold: 1,
            window: Duration::from_secs(15 * 60),
        }
    }
}

impl AlertConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let webhook_url = std::env::var("ALERT_WEBHOOK_URL")
            .ok()
            .filter(|u| !u.trim().is_empty());

        let error_threshold = match std::env::var("ALERT_ERROR_THRESHOLD") {
            Ok(v) => v
                .trim()
                .parse::<i64>()
                .with_context(|| format!("Invalid ALERT_ERROR_THRESHOLD: {v}"))?
                .max(1),
            Err(_) => defaults.error_threshold,
        };

        let window = match std::env::var("ALERT_WINDOW_MINUTES") {
            Ok(v) => {
                let minutes = v
                    .trim()
                    .parse::<u64>()
                    .with_context(|| format!("Invalid ALERT_WINDOW_MINUTES: {v}"))?;
                Duration::from_secs(minutes.max(1) * 60)
            }
            Err(_) => defaults.window,
        };

        Ok(Self {
            webhook_url,
            error_threshold,
            window,
        })
    }

    fn window_minutes(&self) -> u64 {
        self.window.as_secs() / 60
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertOutcome {
    Quiet { errors: i64 },
    /// `delivered` is false when no webhook is configured or delivery failed
    Raised { errors: i64, delivered: bool },
}

pub struct FailureAlerter {
    audit: Arc<dyn AuditStore>,
    http: reqwest::Client,
    config: AlertConfig,
}

impl FailureAlerter {
    pub fn new(audit: Arc<dyn AuditStore>, config: AlertConfig) -> Self {
        Self {
            audit,
            http: reqwest::Client::new(),
            config,
        }
    }

    pub fn config(&self) -> &AlertConfig {
        &self.config
    }

    /// Count error rows in the window ending at `now` and alert if needed
    pub async fn check(&self, now: OffsetDateTime) -> BillingResult<AlertOutcome> {
        let since = now - self.config.window;
        let errors = self
            .audit
            .count_since(ActivityStatus::Error, since)
            .await?;

        if errors < self.config.error_threshold {
            return Ok(AlertOutcome::Quiet { errors });
        }

        error!(
            errors = errors,
            window_minutes = self.config.window_minutes(),
            threshold = self.config.error_threshold,
            "Upgrade reconciliation failures at or above alert threshold"
        );

        let delivered = match &self.config.webhook_url {
            Some(url) => self.deliver(url, errors).await,
            None => false,
        };

        Ok(AlertOutcome::Raised { errors, delivered })
    }

    async fn deliver(&self, url: &str, errors: i64) -> bool {
        let message = alert_message(errors, self.config.window_minutes());

        match self
            .http
            .post(url)
            .timeout(ALERT_TIMEOUT)
            .json(&message)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                error!(status = %response.status(), "Alert webhook rejected the message");
                false
            }
            Err(e) => {
                error!(error = %e, "Failed to deliver alert");
                false
            }
        }
    }
}

fn alert_message(errors: i64, window_minutes: u64) -> Value {
    let noun = if errors == 1 { "failure" } else { "failures" };
    json!({
        "text": format!(
            "Upshift: {errors} upgrade reconciliation {noun} in the last {window_minutes} minutes. \
             Check the activity log for the affected memberships."
        )
    })
}
