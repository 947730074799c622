use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// Dispatchability of a driver. Every transition between these states goes
/// through [`crate::engine::state_machine::StateMachine`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationalState {
    Offline,
    Available,
    Busy,
    Returning,
    OnBreak,
}

impl OperationalState {
    pub const ALL: [OperationalState; 5] = [
        OperationalState::Offline,
        OperationalState::Available,
        OperationalState::Busy,
        OperationalState::Returning,
        OperationalState::OnBreak,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OperationalState::Offline => "OFFLINE",
            OperationalState::Available => "AVAILABLE",
            OperationalState::Busy => "BUSY",
            OperationalState::Returning => "RETURNING",
            OperationalState::OnBreak => "ON_BREAK",
        }
    }

    /// States in which the driver is on shift and accruing working time.
    pub fn is_on_duty(self) -> bool {
        !matches!(self, OperationalState::Offline | OperationalState::OnBreak)
    }
}

impl fmt::Display for OperationalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Service lines a driver can serve and an order can require.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceType {
    Barq,
    Bullet,
    Express,
    Standard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Driver {
    pub id: Uuid,
    pub name: String,
    pub operational_state: OperationalState,
    pub version: u64,
    pub is_active: bool,
    pub current_location: GeoPoint,
    pub service_types: BTreeSet<ServiceType>,
    pub capacity_kg: f64,
    pub current_load_kg: f64,
    pub rating: f64,
    pub target_deliveries: u32,
    pub completed_today: u32,
    pub consecutive_deliveries: u32,
    pub hours_worked_today: f64,
    pub max_working_hours: f64,
    pub requires_break_after: u32,
    pub on_time_rate: Option<f64>,
    pub active_order_id: Option<Uuid>,
    /// Start of the current uninterrupted on-duty span.
    pub on_duty_since: Option<DateTime<Utc>>,
    /// Set once `breakRequired` has been published for the current streak.
    pub break_signalled: bool,
    pub last_state_change_at: DateTime<Utc>,
}

impl Driver {
    pub fn new(name: impl Into<String>, location: GeoPoint, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            operational_state: OperationalState::Offline,
            version: 0,
            is_active: true,
            current_location: location,
            service_types: BTreeSet::new(),
            capacity_kg: 20.0,
            current_load_kg: 0.0,
            rating: 5.0,
            target_deliveries: 20,
            completed_today: 0,
            consecutive_deliveries: 0,
            hours_worked_today: 0.0,
            max_working_hours: 10.0,
            requires_break_after: 5,
            on_time_rate: None,
            active_order_id: None,
            on_duty_since: None,
            break_signalled: false,
            last_state_change_at: now,
        }
    }

    pub fn gap_from_target(&self) -> i64 {
        i64::from(self.target_deliveries) - i64::from(self.completed_today)
    }

    /// Hours worked today including the open on-duty span.
    pub fn hours_worked_at(&self, now: DateTime<Utc>) -> f64 {
        let open_span = self
            .on_duty_since
            .map(|since| hours_between(since, now))
            .unwrap_or(0.0);
        self.hours_worked_today + open_span
    }

    pub fn remaining_capacity_kg(&self) -> f64 {
        (self.capacity_kg - self.current_load_kg).max(0.0)
    }
}

pub(crate) fn hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let millis = (to - from).num_milliseconds().max(0);
    millis as f64 / 3_600_000.0
}
