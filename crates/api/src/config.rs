//! API server configuration

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{key} has an invalid value: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// Enables webhook signature verification when set
    pub webhook_secret: Option<String>,
    /// Company owning the gating product
    pub gating_company_id: String,
    /// The operator's own product tenants must be subscribed to
    pub gating_product_id: String,
    pub entitlement_gate_enabled: bool,
    /// HS256 secret of the `x-user-token` header
    pub user_token_secret: Option<String>,
    pub queue_capacity: usize,
    pub queue_max_concurrency: usize,
    /// How long shutdown waits for accepted reconciliation jobs
    pub shutdown_grace: Duration,
    pub allowed_origins: Vec<String>,
    pub json_logs: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            bind_address: "0.0.0.0:3001".to_string(),
            webhook_secret: None,
            gating_company_id: String::new(),
            gating_product_id: String::new(),
            entitlement_gate_enabled: true,
            user_token_secret: None,
            queue_capacity: 1024,
            queue_max_concurrency: 8,
            shutdown_grace: Duration::from_secs(30),
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://127.0.0.1:3000".to_string(),
            ],
            json_logs: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let database_url = non_empty("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let allowed_origins = match non_empty("ALLOWED_ORIGINS") {
            Some(raw) => raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => defaults.allowed_origins,
        };

        Ok(Self {
            database_url,
            bind_address: non_empty("BIND_ADDRESS").unwrap_or(defaults.bind_address),
            webhook_secret: non_empty("WEBHOOK_SECRET"),
            gating_company_id: non_empty("GATING_COMPANY_ID").unwrap_or_default(),
            gating_product_id: non_empty("GATING_PRODUCT_ID").unwrap_or_default(),
            entitlement_gate_enabled: parse_or(
                "ENTITLEMENT_GATE_ENABLED",
                defaults.entitlement_gate_enabled,
            )?,
            user_token_secret: non_empty("USER_TOKEN_SECRET"),
            queue_capacity: parse_or("QUEUE_CAPACITY", defaults.queue_capacity)?,
            queue_max_concurrency: parse_or("QUEUE_MAX_CONCURRENCY", defaults.queue_max_concurrency)?,
            shutdown_grace: Duration::from_secs(parse_or(
                "SHUTDOWN_GRACE_SECS",
                defaults.shutdown_grace.as_secs(),
            )?),
            allowed_origins,
            json_logs: non_empty("LOG_FORMAT").is_some_and(|f| f.eq_ignore_ascii_case("json")),
        })
    }
}

fn non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match non_empty(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        None => Ok(default),
    }
}
