use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlaViolation {
    pub order_id: Uuid,
    pub driver_id: Uuid,
    pub severity: Severity,
    pub delay_minutes: f64,
    pub created_at: DateTime<Utc>,
}

/// Timeliness of an order that has not been delivered yet.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SlaStatus {
    OnTrack,
    AtRisk,
    Breached,
}

/// Fleet-level compliance band.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceTier {
    Excellent,
    Good,
    Warning,
    Critical,
}

impl ComplianceTier {
    pub fn from_rate(rate_percent: f64) -> Self {
        if rate_percent >= 95.0 {
            ComplianceTier::Excellent
        } else if rate_percent >= 90.0 {
            ComplianceTier::Good
        } else if rate_percent >= 85.0 {
            ComplianceTier::Warning
        } else {
            ComplianceTier::Critical
        }
    }
}
