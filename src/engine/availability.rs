use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DispatchConfig;
use crate::models::driver::{Driver, OperationalState};

/// Why a driver cannot take new work. Variants follow the order in which
/// the predicates are evaluated.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableReason {
    Offline,
    Busy,
    Returning,
    OnBreak,
    Inactive,
    MaxHoursReached,
    RequiresBreak,
    CapacityExceeded,
}

impl UnavailableReason {
    pub fn as_str(self) -> &'static str {
        match self {
            UnavailableReason::Offline => "offline",
            UnavailableReason::Busy => "busy",
            UnavailableReason::Returning => "returning",
            UnavailableReason::OnBreak => "on_break",
            UnavailableReason::Inactive => "inactive",
            UnavailableReason::MaxHoursReached => "max_hours_reached",
            UnavailableReason::RequiresBreak => "requires_break",
            UnavailableReason::CapacityExceeded => "capacity_exceeded",
        }
    }
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AvailabilityCheck {
    pub available: bool,
    pub reason: Option<UnavailableReason>,
    pub eta_to_available_minutes: Option<f64>,
}

/// Read-only eligibility rules. Never touches storage.
#[derive(Debug, Clone)]
pub struct AvailabilityEngine {
    typical_delivery_minutes: f64,
    typical_return_minutes: f64,
    typical_break_minutes: f64,
}

impl AvailabilityEngine {
    pub fn new(config: &DispatchConfig) -> Self {
        Self {
            typical_delivery_minutes: config.typical_delivery_minutes,
            typical_return_minutes: config.typical_return_minutes,
            typical_break_minutes: config.typical_break_minutes,
        }
    }

    pub fn is_available(&self, driver: &Driver, candidate_load_kg: f64, now: DateTime<Utc>) -> bool {
        first_failure(driver, candidate_load_kg, now).is_none()
    }

    pub fn check(&self, driver: &Driver, candidate_load_kg: f64, now: DateTime<Utc>) -> AvailabilityCheck {
        let reason = first_failure(driver, candidate_load_kg, now);
        AvailabilityCheck {
            available: reason.is_none(),
            reason,
            eta_to_available_minutes: self.eta_to_available(driver, now),
        }
    }

    fn eta_to_available(&self, driver: &Driver, now: DateTime<Utc>) -> Option<f64> {
        let typical = match driver.operational_state {
            OperationalState::Busy => self.typical_delivery_minutes,
            OperationalState::Returning => self.typical_return_minutes,
            OperationalState::OnBreak => self.typical_break_minutes,
            OperationalState::Offline | OperationalState::Available => return None,
        };
        let elapsed = (now - driver.last_state_change_at).num_seconds().max(0) as f64 / 60.0;
        Some((typical - elapsed).max(0.0))
    }
}

fn first_failure(driver: &Driver, candidate_load_kg: f64, now: DateTime<Utc>) -> Option<UnavailableReason> {
    let state_reason = match driver.operational_state {
        OperationalState::Available => None,
        OperationalState::Offline => Some(UnavailableReason::Offline),
        OperationalState::Busy => Some(UnavailableReason::Busy),
        OperationalState::Returning => Some(UnavailableReason::Returning),
        OperationalState::OnBreak => Some(UnavailableReason::OnBreak),
    };
    if state_reason.is_some() {
        return state_reason;
    }
    if !driver.is_active {
        return Some(UnavailableReason::Inactive);
    }
    if driver.hours_worked_at(now) >= driver.max_working_hours {
        return Some(UnavailableReason::MaxHoursReached);
    }
    if driver.consecutive_deliveries >= driver.requires_break_after {
        return Some(UnavailableReason::RequiresBreak);
    }
    if driver.current_load_kg + candidate_load_kg > driver.capacity_kg {
        return Some(UnavailableReason::CapacityExceeded);
    }
    None
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::{AvailabilityEngine, UnavailableReason};
    use crate::config::DispatchConfig;
    use crate::models::driver::{Driver, GeoPoint, OperationalState};

    fn engine() -> AvailabilityEngine {
        AvailabilityEngine::new(&DispatchConfig::default())
    }

    fn available_driver() -> Driver {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let mut driver = Driver::new("Lina", GeoPoint { lat: 24.7, lng: 46.7 }, now);
        driver.operational_state = OperationalState::Available;
        driver
    }

    #[test]
    fn fresh_available_driver_passes() {
        let driver = available_driver();
        let check = engine().check(&driver, 2.0, driver.last_state_change_at);
        assert!(check.available);
        assert_eq!(check.reason, None);
        assert_eq!(check.eta_to_available_minutes, None);
    }

    #[test]
    fn exhausted_hours_block_every_state() {
        for state in OperationalState::ALL {
            let mut driver = available_driver();
            driver.operational_state = state;
            driver.hours_worked_today = driver.max_working_hours;
            assert!(!engine().is_available(&driver, 0.0, driver.last_state_change_at));
        }
    }

    #[test]
    fn open_shift_span_counts_toward_the_hour_limit() {
        let mut driver = available_driver();
        driver.hours_worked_today = 9.0;
        driver.on_duty_since = Some(driver.last_state_change_at);
        let later = driver.last_state_change_at + Duration::hours(1);

        let check = engine().check(&driver, 0.0, later);
        assert_eq!(check.reason, Some(UnavailableReason::MaxHoursReached));
    }

    #[test]
    fn first_failing_predicate_wins() {
        let mut driver = available_driver();
        driver.is_active = false;
        driver.consecutive_deliveries = driver.requires_break_after;
        driver.current_load_kg = driver.capacity_kg;

        let now = driver.last_state_change_at;
        assert_eq!(engine().check(&driver, 1.0, now).reason, Some(UnavailableReason::Inactive));

        driver.is_active = true;
        assert_eq!(
            engine().check(&driver, 1.0, now).reason,
            Some(UnavailableReason::RequiresBreak)
        );

        driver.consecutive_deliveries = 0;
        assert_eq!(
            engine().check(&driver, 1.0, now).reason,
            Some(UnavailableReason::CapacityExceeded)
        );
        assert!(engine().is_available(&driver, 0.0, now));
    }

    #[test]
    fn eta_counts_down_from_the_typical_cycle() {
        let mut driver = available_driver();
        driver.operational_state = OperationalState::Busy;
        let now = driver.last_state_change_at + Duration::minutes(10);

        let check = engine().check(&driver, 0.0, now);
        assert_eq!(check.reason, Some(UnavailableReason::Busy));
        assert_eq!(check.eta_to_available_minutes, Some(20.0));

        let overdue = driver.last_state_change_at + Duration::minutes(45);
        assert_eq!(engine().check(&driver, 0.0, overdue).eta_to_available_minutes, Some(0.0));
    }

    #[test]
    fn offline_driver_has_no_eta() {
        let mut driver = available_driver();
        driver.operational_state = OperationalState::Offline;
        let check = engine().check(&driver, 0.0, driver.last_state_change_at);
        assert_eq!(check.reason, Some(UnavailableReason::Offline));
        assert_eq!(check.eta_to_available_minutes, None);
    }
}
