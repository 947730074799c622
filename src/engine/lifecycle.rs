use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::dispatch::DispatchEngine;
use crate::engine::state_machine::{Committed, TransitionContext};
use crate::error::{DispatchError, Result};
use crate::events::DispatchEvent;
use crate::models::driver::{Driver, GeoPoint, OperationalState};
use crate::models::order::{Order, OrderStatus};
use crate::models::sla::SlaViolation;
use crate::models::transition::{TransitionReason, TriggeredBy};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DeliveryReport {
    pub distance_from_base_km: f64,
}

impl DispatchEngine {
    pub fn start_shift(&self, driver_id: Uuid, location: GeoPoint) -> Result<Driver> {
        let driver = self
            .state_machine
            .commit(
                driver_id,
                OperationalState::Available,
                TransitionReason::ShiftStart,
                TransitionContext::by(TriggeredBy::Driver),
                |driver, _| {
                    driver.current_location = location;
                    Ok(())
                },
            )?
            .publish();
        info!(driver_id = %driver_id, "shift started");
        Ok(driver)
    }

    /// Ends the shift from any on-shift state. A BUSY driver's order goes
    /// back to the pending pool.
    pub fn end_shift(&self, driver_id: Uuid) -> Result<Driver> {
        self.go_offline(driver_id, TransitionReason::ShiftEnd, TriggeredBy::Driver)
    }

    /// BUSY -> OFFLINE without finishing the order. The order is released
    /// unassigned; re-dispatching it is left to the caller.
    pub fn emergency_stop(&self, driver_id: Uuid) -> Result<Driver> {
        self.go_offline(driver_id, TransitionReason::Emergency, TriggeredBy::Dispatcher)
    }

    pub fn start_break(&self, driver_id: Uuid) -> Result<Driver> {
        let current = self.repo.load_driver(driver_id)?;
        let reason = match current.operational_state {
            OperationalState::Returning => TransitionReason::BreakNeeded,
            _ => TransitionReason::BreakStarted,
        };
        self.state_machine.transition(
            driver_id,
            OperationalState::OnBreak,
            reason,
            TransitionContext::by(TriggeredBy::Driver).at_version(current.version),
        )
    }

    pub fn end_break(&self, driver_id: Uuid) -> Result<Driver> {
        self.state_machine.transition(
            driver_id,
            OperationalState::Available,
            TransitionReason::BreakCompleted,
            TransitionContext::by(TriggeredBy::Driver),
        )
    }

    pub fn return_to_zone(&self, driver_id: Uuid) -> Result<Driver> {
        self.state_machine.transition(
            driver_id,
            OperationalState::Available,
            TransitionReason::ReturnedToZone,
            TransitionContext::by(TriggeredBy::Driver),
        )
    }

    /// Order-side only; the driver stays BUSY. The order row is re-checked
    /// on every write attempt, so a delivery landing first wins.
    pub fn complete_pickup(&self, driver_id: Uuid, order_id: Uuid) -> Result<Order> {
        let driver = self.repo.load_driver(driver_id)?;
        if driver.active_order_id != Some(order_id) {
            return Err(DispatchError::OrderNotHeldByDriver { order_id, driver_id });
        }

        let now = self.clock.now();
        let order = self.update_order(order_id, |order| {
            if order.assigned_driver_id != Some(driver_id) {
                return Err(DispatchError::OrderNotHeldByDriver { order_id, driver_id });
            }
            if order.status != OrderStatus::Assigned {
                return Err(DispatchError::InvalidInput(format!(
                    "order {order_id} cannot be picked up from status {:?}",
                    order.status
                )));
            }
            order.status = OrderStatus::PickedUp;
            order.picked_up_at = Some(now);
            Ok(())
        })?;
        info!(order_id = %order_id, driver_id = %driver_id, "order picked up");
        Ok(order)
    }

    /// Closes the driver's active order. Far drops send the driver to
    /// RETURNING, near ones straight back to AVAILABLE. Lateness is judged
    /// against the commit timestamp.
    pub fn complete_delivery(&self, driver_id: Uuid, order_id: Uuid, report: DeliveryReport) -> Result<Driver> {
        if !report.distance_from_base_km.is_finite() || report.distance_from_base_km < 0.0 {
            return Err(DispatchError::InvalidInput(format!(
                "distance_from_base_km must be a non-negative number, got {}",
                report.distance_from_base_km
            )));
        }

        let order = self.repo.load_order(order_id)?;
        let (to, reason) = if report.distance_from_base_km > self.config.far_threshold_km {
            (OperationalState::Returning, TransitionReason::DeliveryCompletedFar)
        } else {
            (OperationalState::Available, TransitionReason::DeliveryCompletedNear)
        };

        let sla = &self.sla;
        let mut violation: Option<SlaViolation> = None;
        let committed = self.state_machine.commit(
            driver_id,
            to,
            reason,
            TransitionContext::by(TriggeredBy::Driver).with_order(order_id),
            |driver, effects| {
                if effects.before.active_order_id != Some(order_id) {
                    return Err(DispatchError::OrderNotHeldByDriver { order_id, driver_id });
                }

                driver.completed_today += 1;
                driver.consecutive_deliveries += 1;
                driver.current_load_kg = (driver.current_load_kg - order.weight_kg).max(0.0);

                violation = sla.evaluate(&order, driver_id, effects.at);
                effects.events.push(DispatchEvent::DeliveryCompleted {
                    driver_id,
                    order_id,
                    delivered_at: effects.at,
                    completed_today: driver.completed_today,
                    consecutive_deliveries: driver.consecutive_deliveries,
                    gap_from_target: driver.gap_from_target(),
                    on_time: violation.is_none(),
                });
                if let Some(violation) = &violation {
                    effects.events.push(DispatchEvent::SlaBreach {
                        violation: violation.clone(),
                    });
                }
                if driver.consecutive_deliveries >= driver.requires_break_after && !driver.break_signalled {
                    driver.break_signalled = true;
                    effects.events.push(DispatchEvent::BreakRequired {
                        driver_id,
                        consecutive_deliveries: driver.consecutive_deliveries,
                        requires_break_after: driver.requires_break_after,
                        at: effects.at,
                    });
                }
                Ok(())
            },
        )?;

        let delivered_at = committed.driver().last_state_change_at;
        self.update_order(order_id, |stored| {
            if stored.assigned_driver_id != Some(driver_id) {
                return Err(DispatchError::OrderNotHeldByDriver { order_id, driver_id });
            }
            stored.status = OrderStatus::Delivered;
            stored.delivered_at = Some(delivered_at);
            Ok(())
        })?;

        self.sla.record_delivery(driver_id, violation.is_none());
        if let Some(violation) = &violation {
            self.repo.save_violation(violation)?;
            self.metrics
                .sla_breaches_total
                .with_label_values(&[violation.severity.as_str()])
                .inc();
            warn!(
                order_id = %order_id,
                driver_id = %driver_id,
                severity = %violation.severity,
                delay_minutes = violation.delay_minutes,
                "sla breached"
            );
        }

        let driver = committed.publish();
        info!(
            order_id = %order_id,
            driver_id = %driver_id,
            state = %driver.operational_state,
            completed_today = driver.completed_today,
            "delivery completed"
        );
        Ok(driver)
    }

    fn go_offline(&self, driver_id: Uuid, reason: TransitionReason, triggered_by: TriggeredBy) -> Result<Driver> {
        let current = self.repo.load_driver(driver_id)?;
        let held_order = match current.active_order_id {
            Some(order_id) => Some(self.repo.load_order(order_id)?),
            None => None,
        };
        let released_weight = held_order.as_ref().map(|order| order.weight_kg).unwrap_or(0.0);

        let mut ctx = TransitionContext::by(triggered_by).at_version(current.version);
        if let Some(order) = &held_order {
            ctx = ctx.with_order(order.id);
        }

        let committed: Committed = self.state_machine.commit(
            driver_id,
            OperationalState::Offline,
            reason,
            ctx,
            |driver, _| {
                driver.current_load_kg = (driver.current_load_kg - released_weight).max(0.0);
                Ok(())
            },
        )?;

        if let Some(held) = held_order {
            self.update_order(held.id, |order| {
                if !order.status.is_open() || order.assigned_driver_id != Some(driver_id) {
                    return Err(DispatchError::OrderNotHeldByDriver {
                        order_id: order.id,
                        driver_id,
                    });
                }
                order.status = OrderStatus::Pending;
                order.assigned_driver_id = None;
                order.assigned_at = None;
                order.picked_up_at = None;
                Ok(())
            })?;
            warn!(
                driver_id = %driver_id,
                order_id = %held.id,
                reason = %reason,
                "driver went offline holding an order; order released"
            );
        }

        let driver = committed.publish();
        info!(driver_id = %driver_id, reason = %reason, "driver offline");
        Ok(driver)
    }
}
