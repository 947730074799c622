use std::sync::{Arc, Weak};
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::config::DispatchConfig;
use crate::engine::availability::{AvailabilityEngine, UnavailableReason};
use crate::engine::scoring::{rank, Candidate, ScoringWeights};
use crate::engine::sla::SlaMonitor;
use crate::engine::state_machine::{Committed, StateMachine, TransitionContext};
use crate::error::{DispatchError, Result};
use crate::events::{DispatchEvent, EventBus, EventKind};
use crate::geo::{DistanceProvider, Haversine};
use crate::models::assignment::Assignment;
use crate::models::driver::{Driver, OperationalState};
use crate::models::order::{Order, OrderStatus};
use crate::models::transition::{TransitionReason, TriggeredBy};
use crate::observability::metrics::Metrics;
use crate::store::Repository;

/// Per-call overrides for candidate filtering.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DispatchConstraints {
    pub radius_km: f64,
    pub min_rating: f64,
    pub max_claim_attempts: Option<u32>,
}

impl DispatchConstraints {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            radius_km: config.default_radius_km,
            min_rating: config.default_min_rating,
            max_claim_attempts: None,
        }
    }
}

pub struct EngineBuilder {
    repo: Arc<dyn Repository>,
    config: DispatchConfig,
    clock: Arc<dyn Clock>,
    distance: Arc<dyn DistanceProvider>,
    event_buffer_size: usize,
    metrics: Metrics,
}

impl EngineBuilder {
    pub fn config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn distance(mut self, distance: Arc<dyn DistanceProvider>) -> Self {
        self.distance = distance;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = size;
        self
    }

    pub fn metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn build(self) -> Result<Arc<DispatchEngine>> {
        self.config.validate()?;

        let bus = Arc::new(EventBus::new(self.event_buffer_size, self.metrics.clone()));
        let state_machine = StateMachine::new(
            Arc::clone(&self.repo),
            Arc::clone(&bus),
            Arc::clone(&self.clock),
            self.metrics.clone(),
        );

        let engine = Arc::new(DispatchEngine {
            availability: AvailabilityEngine::new(&self.config),
            sla: SlaMonitor::new(self.config.sla_at_risk_minutes),
            weights: ScoringWeights::from(&self.config),
            repo: self.repo,
            bus,
            state_machine,
            distance: self.distance,
            clock: self.clock,
            config: self.config,
            metrics: self.metrics,
            in_flight: DashMap::new(),
        });

        if engine.config.auto_break_on_threshold {
            install_auto_break(&engine);
        }

        Ok(engine)
    }
}

/// Entry point for every driver and order operation. One instance owns its
/// own event bus, so several engines can share a process without seeing
/// each other's events.
pub struct DispatchEngine {
    pub(crate) repo: Arc<dyn Repository>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) state_machine: StateMachine,
    pub(crate) availability: AvailabilityEngine,
    pub(crate) sla: SlaMonitor,
    pub(crate) distance: Arc<dyn DistanceProvider>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: DispatchConfig,
    pub(crate) metrics: Metrics,
    weights: ScoringWeights,
    in_flight: DashMap<Uuid, ()>,
}

/// Marks an order as being dispatched so two callers cannot race on it.
struct OrderReservation<'a> {
    in_flight: &'a DashMap<Uuid, ()>,
    order_id: Uuid,
}

impl Drop for OrderReservation<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.order_id);
    }
}

impl DispatchEngine {
    pub fn builder(repo: Arc<dyn Repository>) -> EngineBuilder {
        EngineBuilder {
            repo,
            config: DispatchConfig::default(),
            clock: Arc::new(SystemClock),
            distance: Arc::new(Haversine),
            event_buffer_size: 1024,
            metrics: Metrics::new(),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn state_machine(&self) -> &StateMachine {
        &self.state_machine
    }

    pub fn availability(&self) -> &AvailabilityEngine {
        &self.availability
    }

    pub fn sla(&self) -> &SlaMonitor {
        &self.sla
    }

    pub fn default_constraints(&self) -> DispatchConstraints {
        DispatchConstraints::from_config(&self.config)
    }

    /// Picks the best eligible driver for `order` and claims it.
    ///
    /// Candidates are ranked on a snapshot; each claim is conditioned on the
    /// snapshot version, so a driver taken by a concurrent dispatch is
    /// skipped in favour of the next one. Gives up with
    /// [`DispatchError::NoAvailableDriver`] after the configured number of
    /// claim attempts.
    pub fn assign_order_to_driver(&self, order: &Order, constraints: &DispatchConstraints) -> Result<Assignment> {
        let start = Instant::now();
        let result = self.dispatch(order, constraints);
        self.record_dispatch_outcome(start, &result);
        result
    }

    /// Dispatcher override: claim a named driver for `order`, surfacing the
    /// precise reason when that driver cannot take it.
    pub fn assign_order_to_specific_driver(&self, order: &Order, driver_id: Uuid) -> Result<Assignment> {
        let start = Instant::now();
        let result = self.dispatch_to(order, driver_id);
        self.record_dispatch_outcome(start, &result);
        result
    }

    /// Cancels an order. A claimed driver is released through the
    /// `order_cancelled` override and gets its carried load back. Refused
    /// while a dispatch of the same order is in flight.
    pub fn cancel_order(&self, order_id: Uuid) -> Result<Order> {
        let _reservation = self.reserve(order_id)?;

        loop {
            let order = self.repo.load_order(order_id)?;
            match order.status {
                OrderStatus::Pending => {
                    let mut cancelled = order.clone();
                    cancelled.status = OrderStatus::Cancelled;
                    match self.repo.commit_order(&cancelled, order.version) {
                        Ok(stored) => {
                            info!(order_id = %order_id, "pending order cancelled");
                            return Ok(stored);
                        }
                        Err(err) if err.is_retryable() => continue,
                        Err(err) => return Err(err),
                    }
                }
                OrderStatus::Assigned | OrderStatus::PickedUp => return self.cancel_claimed(&order),
                OrderStatus::Delivered | OrderStatus::Cancelled => {
                    return Err(DispatchError::InvalidInput(format!(
                        "order {order_id} is already closed"
                    )));
                }
            }
        }
    }

    /// The driver commit decides the race with delivery; the order row
    /// follows whichever side won it.
    fn cancel_claimed(&self, order: &Order) -> Result<Order> {
        let order_id = order.id;
        let driver_id = order
            .assigned_driver_id
            .ok_or_else(|| DispatchError::InvalidInput(format!("order {order_id} has no assignee")))?;
        let weight = order.weight_kg;

        let committed = self.state_machine.commit(
            driver_id,
            OperationalState::Available,
            TransitionReason::OrderCancelled,
            TransitionContext::by(TriggeredBy::Dispatcher).with_order(order_id),
            |driver, effects| {
                if effects.before.active_order_id != Some(order_id) {
                    return Err(DispatchError::OrderNotHeldByDriver { order_id, driver_id });
                }
                driver.current_load_kg = (driver.current_load_kg - weight).max(0.0);
                Ok(())
            },
        )?;

        let cancelled = self.update_order(order_id, |stored| {
            if !stored.status.is_open() || stored.assigned_driver_id != Some(driver_id) {
                return Err(DispatchError::OrderNotHeldByDriver { order_id, driver_id });
            }
            stored.status = OrderStatus::Cancelled;
            Ok(())
        })?;
        committed.publish();
        Ok(cancelled)
    }

    /// Read-modify-write of one order, retried while other writers keep
    /// winning. `apply` sees the latest stored copy on every attempt and
    /// may refuse it.
    pub(crate) fn update_order<F>(&self, order_id: Uuid, mut apply: F) -> Result<Order>
    where
        F: FnMut(&mut Order) -> Result<()>,
    {
        loop {
            let current = self.repo.load_order(order_id)?;
            let mut next = current.clone();
            apply(&mut next)?;
            match self.repo.commit_order(&next, current.version) {
                Err(err) if err.is_retryable() => {
                    debug!(order_id = %order_id, error = %err, "order changed underneath; retrying");
                }
                other => return other,
            }
        }
    }

    fn dispatch(&self, order: &Order, constraints: &DispatchConstraints) -> Result<Assignment> {
        let _reservation = self.reserve(order.id)?;
        let order = self.resolve_order(order)?;
        let now = self.clock.now();

        let ranked = rank(self.candidates(&order, constraints, now));
        if ranked.is_empty() {
            warn!(order_id = %order.id, "no eligible drivers for order");
            return Err(DispatchError::NoAvailableDriver { order_id: order.id });
        }

        let max_attempts = constraints
            .max_claim_attempts
            .unwrap_or(self.config.max_claim_attempts)
            .max(1);

        for (index, candidate) in ranked.iter().take(max_attempts as usize).enumerate() {
            let attempt = index as u32 + 1;
            match self.claim(&order, &candidate.driver, TriggeredBy::System) {
                Ok(committed) => {
                    return self.finish_assignment(&order, committed, candidate, attempt);
                }
                Err(err) if skips_candidate(&err) => {
                    if err.is_retryable() {
                        self.metrics.claim_conflicts_total.inc();
                    }
                    debug!(
                        order_id = %order.id,
                        driver_id = %candidate.driver.id,
                        attempt,
                        error = %err,
                        "candidate lost before claim; trying next"
                    );
                }
                Err(err) => return Err(err),
            }
        }

        warn!(order_id = %order.id, max_attempts, "claim attempts exhausted");
        Err(DispatchError::NoAvailableDriver { order_id: order.id })
    }

    fn dispatch_to(&self, order: &Order, driver_id: Uuid) -> Result<Assignment> {
        let _reservation = self.reserve(order.id)?;
        let order = self.resolve_order(order)?;
        let driver = self.repo.load_driver(driver_id)?;
        let now = self.clock.now();

        if !driver.service_types.contains(&order.service_type) {
            return Err(DispatchError::NoAvailableDriver { order_id: order.id });
        }

        let check = self.availability.check(&driver, order.weight_kg, now);
        match check.reason {
            None => {}
            Some(UnavailableReason::Offline)
            | Some(UnavailableReason::Busy)
            | Some(UnavailableReason::Returning)
            | Some(UnavailableReason::OnBreak) => {
                return Err(DispatchError::InvalidTransition {
                    driver_id,
                    from: driver.operational_state,
                    to: OperationalState::Busy,
                });
            }
            Some(UnavailableReason::CapacityExceeded) => {
                return Err(DispatchError::CapacityExceeded {
                    driver_id,
                    required_kg: order.weight_kg,
                    available_kg: driver.remaining_capacity_kg(),
                });
            }
            Some(_) => return Err(DispatchError::NoAvailableDriver { order_id: order.id }),
        }

        let distance_km = self
            .distance
            .distance_km(&driver.current_location, &order.pickup);
        let candidate = Candidate::new(driver, distance_km, &self.weights);
        let committed = self.claim(&order, &candidate.driver, TriggeredBy::Dispatcher)?;
        self.finish_assignment(&order, committed, &candidate, 1)
    }

    /// Drivers passing every filter, scored but unranked.
    pub(crate) fn candidates(&self, order: &Order, constraints: &DispatchConstraints, now: DateTime<Utc>) -> Vec<Candidate> {
        self.repo
            .list_drivers()
            .into_iter()
            .filter_map(|driver| {
                let eligible = driver.service_types.contains(&order.service_type)
                    && driver.rating >= constraints.min_rating
                    && self.availability.is_available(&driver, order.weight_kg, now);
                if !eligible {
                    return None;
                }

                let distance_km = self
                    .distance
                    .distance_km(&driver.current_location, &order.pickup);
                if distance_km > constraints.radius_km {
                    return None;
                }

                Some(Candidate::new(driver, distance_km, &self.weights))
            })
            .collect()
    }

    /// AVAILABLE -> BUSY conditioned on the version the caller ranked.
    /// Eligibility is re-evaluated against the record being committed.
    fn claim(&self, order: &Order, snapshot: &Driver, triggered_by: TriggeredBy) -> Result<Committed> {
        let availability = &self.availability;
        let order_id = order.id;
        let weight = order.weight_kg;

        self.state_machine.commit(
            snapshot.id,
            OperationalState::Busy,
            TransitionReason::OrderAssigned,
            TransitionContext::by(triggered_by)
                .with_order(order_id)
                .at_version(snapshot.version),
            |driver, effects| {
                let check = availability.check(effects.before, weight, effects.at);
                match check.reason {
                    None => {}
                    Some(UnavailableReason::CapacityExceeded) => {
                        return Err(DispatchError::CapacityExceeded {
                            driver_id: driver.id,
                            required_kg: weight,
                            available_kg: effects.before.remaining_capacity_kg(),
                        });
                    }
                    Some(_) => return Err(DispatchError::NoAvailableDriver { order_id }),
                }
                driver.current_load_kg += weight;
                Ok(())
            },
        )
    }

    fn finish_assignment(
        &self,
        order: &Order,
        committed: Committed,
        candidate: &Candidate,
        attempts: u32,
    ) -> Result<Assignment> {
        let driver_id = committed.driver().id;
        let assigned_at = committed.driver().last_state_change_at;

        let recorded = self.update_order(order.id, |stored| {
            ensure_pending(stored)?;
            stored.status = OrderStatus::Assigned;
            stored.assigned_driver_id = Some(driver_id);
            stored.assigned_at = Some(assigned_at);
            Ok(())
        });
        let order = match recorded {
            Ok(order) => order,
            Err(err) => {
                warn!(order_id = %order.id, driver_id = %driver_id, error = %err, "order changed before assignment was recorded; releasing driver");
                committed.publish();
                self.release_claim(driver_id, order);
                return Err(err);
            }
        };

        let driver = committed.publish();
        let eta_to_pickup_minutes = candidate.distance_km / self.config.average_speed_kmh * 60.0;

        info!(
            order_id = %order.id,
            driver_id = %driver_id,
            score = candidate.score,
            distance_km = candidate.distance_km,
            attempts,
            "order assigned"
        );

        Ok(Assignment {
            order_id: order.id,
            driver,
            score: candidate.score,
            score_breakdown: candidate.breakdown.clone(),
            eta_to_pickup_minutes,
            claim_attempts: attempts,
            assigned_at,
        })
    }

    fn release_claim(&self, driver_id: Uuid, order: &Order) {
        let weight = order.weight_kg;
        let released = self
            .state_machine
            .commit(
                driver_id,
                OperationalState::Available,
                TransitionReason::OrderCancelled,
                TransitionContext::by(TriggeredBy::System).with_order(order.id),
                |driver, effects| {
                    if effects.before.active_order_id != Some(order.id) {
                        return Err(DispatchError::OrderNotHeldByDriver {
                            order_id: order.id,
                            driver_id,
                        });
                    }
                    driver.current_load_kg = (driver.current_load_kg - weight).max(0.0);
                    Ok(())
                },
            )
            .map(Committed::publish);
        if let Err(err) = released {
            error!(driver_id = %driver_id, order_id = %order.id, error = %err, "failed to release claimed driver");
        }
    }

    fn reserve(&self, order_id: Uuid) -> Result<OrderReservation<'_>> {
        if self.in_flight.insert(order_id, ()).is_some() {
            return Err(DispatchError::OrderAlreadyAssigned {
                order_id,
                driver_id: None,
            });
        }
        Ok(OrderReservation {
            in_flight: &self.in_flight,
            order_id,
        })
    }

    /// The stored copy wins over the caller's; new orders are persisted.
    fn resolve_order(&self, order: &Order) -> Result<Order> {
        if self.repo.find_order(order.id).is_none() && (order.weight_kg < 0.0 || !order.weight_kg.is_finite()) {
            return Err(DispatchError::InvalidInput(format!(
                "order {} has invalid weight {}",
                order.id, order.weight_kg
            )));
        }

        let stored = self.repo.insert_order(order)?;
        ensure_pending(&stored)?;
        Ok(stored)
    }

    fn record_dispatch_outcome(&self, start: Instant, result: &Result<Assignment>) {
        let outcome = match result {
            Ok(_) => "success",
            Err(DispatchError::NoAvailableDriver { .. }) => "no_driver",
            Err(_) => "error",
        };
        let elapsed = start.elapsed().as_secs_f64();
        self.metrics
            .dispatch_latency_seconds
            .with_label_values(&[outcome])
            .observe(elapsed);
        self.metrics
            .dispatch_attempts_total
            .with_label_values(&[outcome])
            .inc();
    }
}

fn ensure_pending(order: &Order) -> Result<()> {
    match order.status {
        OrderStatus::Pending if order.assigned_driver_id.is_none() => Ok(()),
        OrderStatus::Delivered | OrderStatus::Cancelled => Err(DispatchError::InvalidInput(format!(
            "order {} is already closed",
            order.id
        ))),
        _ => Err(DispatchError::OrderAlreadyAssigned {
            order_id: order.id,
            driver_id: order.assigned_driver_id,
        }),
    }
}

/// Errors that disqualify one candidate without failing the dispatch.
fn skips_candidate(err: &DispatchError) -> bool {
    matches!(
        err,
        DispatchError::ConcurrentModification { .. }
            | DispatchError::NoAvailableDriver { .. }
            | DispatchError::CapacityExceeded { .. }
    )
}

/// Turns `breakRequired` into an actual break once the driver is idle.
fn install_auto_break(engine: &Arc<DispatchEngine>) {
    let weak: Weak<DispatchEngine> = Arc::downgrade(engine);
    engine.bus.subscribe(EventKind::BreakRequired, move |event| {
        let Some(engine) = weak.upgrade() else {
            return Ok(());
        };
        let DispatchEvent::BreakRequired { driver_id, .. } = event else {
            return Ok(());
        };

        let driver = engine.repo.load_driver(*driver_id)?;
        if matches!(
            driver.operational_state,
            OperationalState::Available | OperationalState::Returning
        ) {
            engine.start_break(*driver_id)?;
            info!(driver_id = %driver_id, "automatic break started");
        }
        Ok(())
    });
}
