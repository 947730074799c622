use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::order::Order;
use crate::models::sla::{ComplianceTier, Severity, SlaStatus, SlaViolation};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct DeliveryTally {
    on_time: u64,
    late: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlaSummary {
    pub deliveries: u64,
    pub on_time: u64,
    pub breaches: u64,
    /// Percentage of on-time deliveries, `None` before the first delivery.
    pub compliance_rate: Option<f64>,
    pub tier: Option<ComplianceTier>,
}

/// Delivery timeliness: breach classification at completion, risk
/// classification for open orders, and per-driver on-time tallies.
#[derive(Debug)]
pub struct SlaMonitor {
    at_risk_minutes: f64,
    tallies: DashMap<Uuid, DeliveryTally>,
}

impl SlaMonitor {
    pub fn new(at_risk_minutes: f64) -> Self {
        Self {
            at_risk_minutes,
            tallies: DashMap::new(),
        }
    }

    /// `None` when the delivery was on time.
    pub fn classify(delay_minutes: f64) -> Option<Severity> {
        if delay_minutes > 30.0 {
            Some(Severity::Critical)
        } else if delay_minutes > 15.0 {
            Some(Severity::High)
        } else if delay_minutes > 0.0 {
            Some(Severity::Medium)
        } else {
            None
        }
    }

    pub fn evaluate(&self, order: &Order, driver_id: Uuid, delivered_at: DateTime<Utc>) -> Option<SlaViolation> {
        let delay_minutes = minutes_between(order.sla_deadline, delivered_at);
        let severity = Self::classify(delay_minutes)?;
        Some(SlaViolation {
            order_id: order.id,
            driver_id,
            severity,
            delay_minutes,
            created_at: delivered_at,
        })
    }

    pub fn status(&self, order: &Order, now: DateTime<Utc>) -> SlaStatus {
        let remaining = minutes_between(now, order.sla_deadline);
        if remaining < 0.0 {
            SlaStatus::Breached
        } else if remaining < self.at_risk_minutes {
            SlaStatus::AtRisk
        } else {
            SlaStatus::OnTrack
        }
    }

    pub(crate) fn record_delivery(&self, driver_id: Uuid, on_time: bool) {
        let mut tally = self.tallies.entry(driver_id).or_default();
        if on_time {
            tally.on_time += 1;
        } else {
            tally.late += 1;
        }
    }

    /// Share of the driver's deliveries that met their deadline, in `[0, 1]`.
    pub fn on_time_rate(&self, driver_id: Uuid) -> Option<f64> {
        let tally = *self.tallies.get(&driver_id)?;
        let total = tally.on_time + tally.late;
        (total > 0).then(|| tally.on_time as f64 / total as f64)
    }

    pub fn summary(&self) -> SlaSummary {
        let (on_time, late) = self
            .tallies
            .iter()
            .fold((0, 0), |(on_time, late), entry| {
                (on_time + entry.on_time, late + entry.late)
            });
        let deliveries = on_time + late;
        let compliance_rate = (deliveries > 0).then(|| on_time as f64 / deliveries as f64 * 100.0);

        SlaSummary {
            deliveries,
            on_time,
            breaches: late,
            compliance_rate,
            tier: compliance_rate.map(ComplianceTier::from_rate),
        }
    }
}

/// Microsecond resolution, so a delivery a hair past the deadline is late.
fn minutes_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let delta = to - from;
    match delta.num_microseconds() {
        Some(micros) => micros as f64 / 60_000_000.0,
        None => delta.num_milliseconds() as f64 / 60_000.0,
    }
}
