//! Vocabulary shared across crates
//!
//! All three enums are persisted as lowercase TEXT columns and travel over the
//! wire in the same form, so `as_str` and `FromStr` are the single source of truth
//! for their spelling.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Error returned when a stored or upstream string names no known variant
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseVariantError {
    pub kind: &'static str,
    pub value: String,
}

/// Billing model of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanType {
    /// Recurring subscription
    Renewal,
    /// Single purchase, never renews
    OneTime,
}

impl PlanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanType::Renewal => "renewal",
            PlanType::OneTime => "one_time",
        }
    }

    pub fn is_renewal(&self) -> bool {
        matches!(self, PlanType::Renewal)
    }
}

impl fmt::Display for PlanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for PlanType {
    type Error = ParseVariantError;

    fn try_from(value: String) -> Result<Self, ParseVariantError> {
        value.parse()
    }
}

impl FromStr for PlanType {
    type Err = ParseVariantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "renewal" => Ok(PlanType::Renewal),
            "one_time" | "one-time" => Ok(PlanType::OneTime),
            other => Err(ParseVariantError {
                kind: "plan type",
                value: other.to_string(),
            }),
        }
    }
}

/// When a superseded membership is canceled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationTiming {
    /// Cancel now, access ends immediately
    Immediate,
    /// Stop renewal, access runs to the end of the paid period
    #[default]
    PeriodEnd,
}

impl CancellationTiming {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancellationTiming::Immediate => "immediate",
            CancellationTiming::PeriodEnd => "period_end",
        }
    }

    pub fn is_immediate(&self) -> bool {
        matches!(self, CancellationTiming::Immediate)
    }
}

impl fmt::Display for CancellationTiming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for CancellationTiming {
    type Error = ParseVariantError;

    fn try_from(value: String) -> Result<Self, ParseVariantError> {
        value.parse()
    }
}

impl FromStr for CancellationTiming {
    type Err = ParseVariantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "immediate" => Ok(CancellationTiming::Immediate),
            "period_end" => Ok(CancellationTiming::PeriodEnd),
            other => Err(ParseVariantError {
                kind: "cancellation timing",
                value: other.to_string(),
            }),
        }
    }
}

/// Terminal outcome recorded in the activity log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Canceled,
    Skipped,
    Error,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityStatus::Canceled => "canceled",
            ActivityStatus::Skipped => "skipped",
            ActivityStatus::Error => "error",
        }
    }
}

impl fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for ActivityStatus {
    type Error = ParseVariantError;

    fn try_from(value: String) -> Result<Self, ParseVariantError> {
        value.parse()
    }
}

impl FromStr for ActivityStatus {
    type Err = ParseVariantError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "canceled" => Ok(ActivityStatus::Canceled),
            "skipped" => Ok(ActivityStatus::Skipped),
            "error" => Ok(ActivityStatus::Error),
            other => Err(ParseVariantError {
                kind: "activity status",
                value: other.to_string(),
            }),
        }
    }
}
