use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::availability::AvailabilityCheck;
use crate::engine::dispatch::DispatchEngine;
use crate::engine::sla::SlaSummary;
use crate::error::{DispatchError, Result};
use crate::events::{DispatchEvent, EventKind, SubscriptionId};
use crate::models::driver::{Driver, GeoPoint, OperationalState};
use crate::models::sla::{SlaStatus, SlaViolation};
use crate::models::transition::StateTransition;
use crate::store::HistoryPage;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetStatus {
    pub total_drivers: usize,
    pub by_state: BTreeMap<OperationalState, usize>,
    pub on_duty: usize,
    /// BUSY drivers over on-duty drivers; zero when nobody is on duty.
    pub utilization: f64,
    pub sla: SlaSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderRisk {
    pub order_id: Uuid,
    pub driver_id: Option<Uuid>,
    pub status: SlaStatus,
    pub minutes_remaining: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MaintenanceReport {
    pub updated: usize,
    pub failed: Vec<Uuid>,
}

impl DispatchEngine {
    pub fn register_driver(&self, mut driver: Driver) -> Result<Driver> {
        if driver.capacity_kg <= 0.0 {
            return Err(DispatchError::InvalidInput("capacity_kg must be > 0".to_string()));
        }
        if driver.max_working_hours <= 0.0 {
            return Err(DispatchError::InvalidInput("max_working_hours must be > 0".to_string()));
        }
        if driver.requires_break_after == 0 {
            return Err(DispatchError::InvalidInput("requires_break_after must be > 0".to_string()));
        }
        if driver.operational_state != OperationalState::Offline || driver.active_order_id.is_some() {
            return Err(DispatchError::InvalidInput(
                "drivers are registered OFFLINE without an active order".to_string(),
            ));
        }

        driver.rating = driver.rating.clamp(0.0, 5.0);
        driver.on_duty_since = None;
        self.repo.insert_driver(driver.clone())?;
        self.bus.open_lane(driver.id, driver.version);
        info!(driver_id = %driver.id, name = %driver.name, "driver registered");
        Ok(driver)
    }

    pub fn get_driver(&self, driver_id: Uuid) -> Result<Driver> {
        self.repo.load_driver(driver_id)
    }

    pub fn list_drivers(&self) -> Vec<Driver> {
        self.repo.list_drivers()
    }

    pub fn set_driver_active(&self, driver_id: Uuid, active: bool) -> Result<Driver> {
        self.state_machine.update(driver_id, |driver| {
            driver.is_active = active;
            Ok(())
        })
    }

    pub fn update_location(&self, driver_id: Uuid, location: GeoPoint) -> Result<Driver> {
        self.state_machine.update(driver_id, |driver| {
            driver.current_location = location;
            Ok(())
        })
    }

    pub fn check_availability(&self, driver_id: Uuid) -> Result<AvailabilityCheck> {
        let driver = self.repo.load_driver(driver_id)?;
        Ok(self.availability.check(&driver, 0.0, self.clock.now()))
    }

    pub fn get_fleet_status(&self) -> FleetStatus {
        let drivers = self.repo.list_drivers();
        let mut by_state: BTreeMap<OperationalState, usize> =
            OperationalState::ALL.iter().map(|state| (*state, 0)).collect();
        for driver in &drivers {
            *by_state.entry(driver.operational_state).or_default() += 1;
        }

        for (state, count) in &by_state {
            self.metrics
                .drivers_by_state
                .with_label_values(&[state.as_str()])
                .set(*count as i64);
        }

        let on_duty = drivers
            .iter()
            .filter(|driver| driver.operational_state.is_on_duty())
            .count();
        let busy = by_state
            .get(&OperationalState::Busy)
            .copied()
            .unwrap_or(0);
        let utilization = if on_duty == 0 {
            0.0
        } else {
            busy as f64 / on_duty as f64
        };

        FleetStatus {
            total_drivers: drivers.len(),
            by_state,
            on_duty,
            utilization,
            sla: self.sla.summary(),
        }
    }

    pub fn get_state_history(&self, driver_id: Uuid, page: HistoryPage) -> Result<Vec<StateTransition>> {
        self.repo.load_driver(driver_id)?;
        Ok(self.repo.transitions(driver_id, &page))
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&DispatchEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.bus.subscribe(kind, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    pub fn sla_violations(&self) -> Vec<SlaViolation> {
        self.repo.violations()
    }

    /// Open orders whose deadline is near or already gone, most urgent first.
    pub fn at_risk_orders(&self) -> Vec<OrderRisk> {
        let now = self.clock.now();
        let mut risks: Vec<OrderRisk> = self
            .repo
            .list_orders()
            .into_iter()
            .filter(|order| order.status.is_open())
            .filter_map(|order| {
                let status = self.sla.status(&order, now);
                (status != SlaStatus::OnTrack).then(|| OrderRisk {
                    order_id: order.id,
                    driver_id: order.assigned_driver_id,
                    status,
                    minutes_remaining: (order.sla_deadline - now).num_seconds() as f64 / 60.0,
                })
            })
            .collect();
        risks.sort_by(|a, b| a.minutes_remaining.total_cmp(&b.minutes_remaining));
        risks
    }

    /// Zeroes every driver's daily counters. Each driver is written through
    /// the optimistic path and retried on conflict; drivers that keep
    /// conflicting are reported rather than forced.
    pub fn reset_daily_metrics(&self) -> MaintenanceReport {
        let now = self.clock.now();
        let mut report = MaintenanceReport::default();

        for driver in self.repo.list_drivers() {
            let outcome = self.with_retries(|| {
                self.state_machine.update(driver.id, |d| {
                    d.completed_today = 0;
                    d.consecutive_deliveries = 0;
                    d.hours_worked_today = 0.0;
                    d.break_signalled = false;
                    if d.on_duty_since.is_some() {
                        d.on_duty_since = Some(now);
                    }
                    Ok(())
                })
            });
            match outcome {
                Ok(_) => report.updated += 1,
                Err(err) => {
                    warn!(driver_id = %driver.id, error = %err, "daily reset skipped driver");
                    report.failed.push(driver.id);
                }
            }
        }

        info!(updated = report.updated, failed = report.failed.len(), "daily metrics reset");
        report
    }

    /// Copies the monitor's on-time tally onto the driver record.
    pub fn update_on_time_rate(&self, driver_id: Uuid) -> Result<Option<f64>> {
        let rate = self.sla.on_time_rate(driver_id);
        self.with_retries(|| {
            self.state_machine.update(driver_id, |driver| {
                driver.on_time_rate = rate;
                Ok(())
            })
        })?;
        Ok(rate)
    }

    fn with_retries<T, F>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            match op() {
                Err(err) if err.is_retryable() && attempt < self.config.maintenance_max_retries => {
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
