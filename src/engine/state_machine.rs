use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{DispatchError, Result};
use crate::events::{DispatchEvent, EventBus};
use crate::models::driver::{hours_between, Driver, OperationalState};
use crate::models::transition::{StateTransition, TransitionReason, TriggeredBy};
use crate::observability::metrics::Metrics;
use crate::store::Repository;

use crate::models::driver::OperationalState::{Available, Busy, Offline, OnBreak, Returning};

/// Targets reachable from `from`. Self-loops never appear.
pub fn allowed_targets(from: OperationalState) -> &'static [OperationalState] {
    match from {
        Offline => &[Available],
        Available => &[Busy, OnBreak, Offline],
        Busy => &[Returning, Available, Offline],
        Returning => &[Available, OnBreak, Offline],
        OnBreak => &[Available, Offline],
    }
}

pub fn is_allowed(from: OperationalState, to: OperationalState) -> bool {
    allowed_targets(from).contains(&to)
}

/// Each reason names one edge (or one target) of the table; a reason used
/// on any other edge is refused like an illegal pair.
pub fn reason_fits(reason: TransitionReason, from: OperationalState, to: OperationalState) -> bool {
    use TransitionReason::*;
    match reason {
        ShiftStart => from == Offline && to == Available,
        OrderAssigned => from == Available && to == Busy,
        OrderCancelled | DeliveryCompletedNear => from == Busy && to == Available,
        DeliveryCompletedFar => from == Busy && to == Returning,
        ReturnedToZone => from == Returning && to == Available,
        BreakNeeded => from == Returning && to == OnBreak,
        BreakStarted => to == OnBreak,
        BreakCompleted => from == OnBreak && to == Available,
        ShiftEnd | Emergency => to == Offline,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransitionContext {
    pub triggered_by: TriggeredBy,
    pub order_id: Option<Uuid>,
    /// Version the caller based its decision on. When set, the commit is
    /// refused unless the stored record is still at this version.
    pub expected_version: Option<u64>,
}

impl TransitionContext {
    pub fn by(triggered_by: TriggeredBy) -> Self {
        Self {
            triggered_by,
            order_id: None,
            expected_version: None,
        }
    }

    pub fn with_order(mut self, order_id: Uuid) -> Self {
        self.order_id = Some(order_id);
        self
    }

    pub fn at_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

/// What a commit hook can see and add to.
pub struct Effects<'a> {
    pub before: &'a Driver,
    pub at: DateTime<Utc>,
    pub events: Vec<DispatchEvent>,
}

/// A driver write that reached storage. Its events go out when it is
/// published or dropped, whichever happens first, so a caller bailing out
/// after the commit can never stall the driver's event lane.
#[must_use = "publish the commit to release its events"]
pub struct Committed {
    bus: Arc<EventBus>,
    driver: Driver,
    transition: Option<StateTransition>,
    events: Option<Vec<DispatchEvent>>,
}

impl Committed {
    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    pub fn transition(&self) -> Option<&StateTransition> {
        self.transition.as_ref()
    }

    pub fn publish(mut self) -> Driver {
        self.flush();
        self.driver.clone()
    }

    fn flush(&mut self) {
        if let Some(events) = self.events.take() {
            self.bus
                .publish_committed(self.driver.id, self.driver.version, events);
        }
    }
}

impl Drop for Committed {
    fn drop(&mut self) {
        self.flush();
    }
}

pub struct StateMachine {
    repo: Arc<dyn Repository>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
}

impl StateMachine {
    pub fn new(
        repo: Arc<dyn Repository>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        metrics: Metrics,
    ) -> Self {
        Self {
            repo,
            bus,
            clock,
            metrics,
        }
    }

    pub fn transition(
        &self,
        driver_id: Uuid,
        to: OperationalState,
        reason: TransitionReason,
        ctx: TransitionContext,
    ) -> Result<Driver> {
        self.commit(driver_id, to, reason, ctx, |_, _| Ok(()))
            .map(Committed::publish)
    }

    /// Validates and commits one transition. `apply` runs on the candidate
    /// record after the built-in effects and may veto the commit by
    /// returning an error; nothing is written in that case.
    pub fn commit<F>(
        &self,
        driver_id: Uuid,
        to: OperationalState,
        reason: TransitionReason,
        ctx: TransitionContext,
        apply: F,
    ) -> Result<Committed>
    where
        F: FnOnce(&mut Driver, &mut Effects<'_>) -> Result<()>,
    {
        let current = self.repo.load_driver(driver_id)?;
        self.bus.open_lane(driver_id, current.version);

        if let Some(expected) = ctx.expected_version {
            if current.version != expected {
                return Err(DispatchError::ConcurrentModification {
                    driver_id,
                    expected,
                    actual: current.version,
                });
            }
        }

        let from = current.operational_state;
        if !is_allowed(from, to) || !reason_fits(reason, from, to) {
            return Err(DispatchError::InvalidTransition { driver_id, from, to });
        }
        if to == Busy && ctx.order_id.is_none() {
            return Err(DispatchError::InvalidInput(format!(
                "driver {driver_id} cannot become BUSY without an order"
            )));
        }

        let at = self.next_timestamp(&current);
        let mut next = current.clone();
        apply_builtin_effects(&mut next, from, to, ctx.order_id, at);

        let mut effects = Effects {
            before: &current,
            at,
            events: Vec::new(),
        };
        apply(&mut next, &mut effects)?;
        let extra_events = effects.events;

        next.version = current.version + 1;
        let transition = StateTransition {
            driver_id,
            from_state: from,
            to_state: to,
            reason,
            triggered_by: ctx.triggered_by,
            order_id: ctx.order_id,
            version: next.version,
            timestamp: at,
        };

        self.repo
            .commit_driver(&next, current.version, Some(&transition))?;

        self.metrics
            .state_transitions_total
            .with_label_values(&[from.as_str(), to.as_str()])
            .inc();
        if reason == TransitionReason::OrderCancelled {
            warn!(
                driver_id = %driver_id,
                order_id = ?ctx.order_id,
                "order cancellation released driver"
            );
        }
        debug!(
            driver_id = %driver_id,
            from = %from,
            to = %to,
            reason = %reason,
            version = next.version,
            "state transition committed"
        );

        let mut events = Vec::with_capacity(1 + extra_events.len());
        events.push(DispatchEvent::StateChanged {
            transition: transition.clone(),
        });
        events.extend(extra_events);

        Ok(Committed {
            bus: Arc::clone(&self.bus),
            driver: next,
            transition: Some(transition),
            events: Some(events),
        })
    }

    /// Optimistic write that does not change operational state: daily
    /// resets, location pings, activation flags. Single attempt; the caller
    /// owns retry policy.
    pub fn update<F>(&self, driver_id: Uuid, apply: F) -> Result<Driver>
    where
        F: FnOnce(&mut Driver) -> Result<()>,
    {
        let current = self.repo.load_driver(driver_id)?;
        self.bus.open_lane(driver_id, current.version);

        let mut next = current.clone();
        apply(&mut next)?;
        next.operational_state = current.operational_state;
        next.active_order_id = current.active_order_id;
        next.version = current.version + 1;

        self.repo.commit_driver(&next, current.version, None)?;

        let committed = Committed {
            bus: Arc::clone(&self.bus),
            driver: next,
            transition: None,
            events: Some(Vec::new()),
        };
        Ok(committed.publish())
    }

    /// Per-driver history timestamps are strictly increasing even when the
    /// clock stalls or steps backwards.
    fn next_timestamp(&self, current: &Driver) -> DateTime<Utc> {
        let now = self.clock.now();
        if now > current.last_state_change_at {
            now
        } else {
            current.last_state_change_at + Duration::microseconds(1)
        }
    }
}

fn apply_builtin_effects(
    driver: &mut Driver,
    from: OperationalState,
    to: OperationalState,
    order_id: Option<Uuid>,
    at: DateTime<Utc>,
) {
    driver.operational_state = to;
    driver.last_state_change_at = at;
    driver.active_order_id = if to == Busy { order_id } else { None };

    match (from.is_on_duty(), to.is_on_duty()) {
        (true, false) => {
            if let Some(since) = driver.on_duty_since.take() {
                driver.hours_worked_today += hours_between(since, at);
            }
        }
        (false, true) => driver.on_duty_since = Some(at),
        _ => {}
    }

    if from == OnBreak && to == Available {
        driver.consecutive_deliveries = 0;
        driver.break_signalled = false;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};
    use uuid::Uuid;

    use super::{allowed_targets, is_allowed, StateMachine, TransitionContext};
    use crate::clock::{Clock, ManualClock};
    use crate::error::DispatchError;
    use crate::events::EventBus;
    use crate::models::driver::{Driver, GeoPoint, OperationalState};
    use crate::models::transition::{TransitionReason, TriggeredBy};
    use crate::observability::metrics::Metrics;
    use crate::store::{HistoryPage, InMemoryRepository, Repository};

    struct Fixture {
        repo: Arc<InMemoryRepository>,
        clock: Arc<ManualClock>,
        machine: StateMachine,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(InMemoryRepository::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap(),
        ));
        let metrics = Metrics::new();
        let bus = Arc::new(EventBus::new(64, metrics.clone()));
        let machine = StateMachine::new(repo.clone(), bus, clock.clone(), metrics);
        Fixture {
            repo,
            clock,
            machine,
        }
    }

    /// Stores a driver already sitting in `state`.
    fn seed(fx: &Fixture, state: OperationalState) -> Driver {
        let mut driver = Driver::new("Omar", GeoPoint { lat: 24.7, lng: 46.7 }, fx.clock.now());
        driver.operational_state = state;
        if state == OperationalState::Busy {
            driver.active_order_id = Some(Uuid::new_v4());
        }
        fx.repo.insert_driver(driver.clone()).unwrap();
        driver
    }

    fn reason_for(from: OperationalState, to: OperationalState) -> TransitionReason {
        match (from, to) {
            (_, OperationalState::Offline) => TransitionReason::ShiftEnd,
            (OperationalState::Offline, OperationalState::Available) => TransitionReason::ShiftStart,
            (OperationalState::Busy, OperationalState::Available) => TransitionReason::DeliveryCompletedNear,
            (OperationalState::Returning, OperationalState::Available) => TransitionReason::ReturnedToZone,
            (OperationalState::OnBreak, OperationalState::Available) => TransitionReason::BreakCompleted,
            (_, OperationalState::Available) => TransitionReason::ShiftStart,
            (_, OperationalState::Busy) => TransitionReason::OrderAssigned,
            (_, OperationalState::Returning) => TransitionReason::DeliveryCompletedFar,
            (_, OperationalState::OnBreak) => TransitionReason::BreakStarted,
        }
    }

    #[test]
    fn every_pair_outside_the_table_is_rejected() {
        for from in OperationalState::ALL {
            for to in OperationalState::ALL {
                if is_allowed(from, to) {
                    continue;
                }
                let fx = fixture();
                let driver = seed(&fx, from);
                let ctx = TransitionContext::by(TriggeredBy::System).with_order(Uuid::new_v4());

                let err = fx
                    .machine
                    .transition(driver.id, to, reason_for(from, to), ctx)
                    .unwrap_err();
                assert!(
                    matches!(err, DispatchError::InvalidTransition { from: f, to: t, .. } if f == from && t == to),
                    "{from} -> {to} should be invalid"
                );
                let stored = fx.repo.load_driver(driver.id).unwrap();
                assert_eq!(stored.version, 0);
                assert_eq!(fx.repo.audit().entry_count(driver.id), 0);
            }
        }
    }

    #[test]
    fn every_pair_in_the_table_commits_once() {
        for from in OperationalState::ALL {
            for &to in allowed_targets(from) {
                let fx = fixture();
                let driver = seed(&fx, from);
                let ctx = TransitionContext::by(TriggeredBy::System).with_order(Uuid::new_v4());

                let updated = fx
                    .machine
                    .transition(driver.id, to, reason_for(from, to), ctx)
                    .unwrap();

                assert_eq!(updated.operational_state, to);
                assert_eq!(updated.version, 1);
                assert_eq!(updated.active_order_id.is_some(), to == OperationalState::Busy);
                let history = fx.repo.transitions(driver.id, &HistoryPage::latest(10));
                assert_eq!(history.len(), 1, "{from} -> {to}");
                assert_eq!(history[0].from_state, from);
                assert_eq!(history[0].to_state, to);
            }
        }
    }

    #[test]
    fn reasons_are_bound_to_their_edges() {
        let fx = fixture();
        let driver = seed(&fx, OperationalState::Offline);
        for reason in [TransitionReason::BreakCompleted, TransitionReason::ReturnedToZone] {
            let err = fx
                .machine
                .transition(
                    driver.id,
                    OperationalState::Available,
                    reason,
                    TransitionContext::by(TriggeredBy::Driver),
                )
                .unwrap_err();
            assert_eq!(err.kind(), "invalid_transition");
        }
        assert!(super::reason_fits(
            TransitionReason::Emergency,
            OperationalState::Busy,
            OperationalState::Offline
        ));
    }

    #[test]
    fn self_transitions_are_never_allowed() {
        for state in OperationalState::ALL {
            assert!(!is_allowed(state, state));
        }
    }

    #[test]
    fn stale_expected_version_is_a_concurrent_modification() {
        let fx = fixture();
        let driver = seed(&fx, OperationalState::Offline);
        fx.machine
            .transition(
                driver.id,
                OperationalState::Available,
                TransitionReason::ShiftStart,
                TransitionContext::by(TriggeredBy::Driver),
            )
            .unwrap();

        let err = fx
            .machine
            .transition(
                driver.id,
                OperationalState::Busy,
                TransitionReason::OrderAssigned,
                TransitionContext::by(TriggeredBy::System)
                    .with_order(Uuid::new_v4())
                    .at_version(0),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::ConcurrentModification {
                expected: 0,
                actual: 1,
                ..
            }
        ));
    }

    #[test]
    fn busy_requires_an_order() {
        let fx = fixture();
        let driver = seed(&fx, OperationalState::Available);
        let err = fx
            .machine
            .transition(
                driver.id,
                OperationalState::Busy,
                TransitionReason::OrderAssigned,
                TransitionContext::by(TriggeredBy::System),
            )
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[test]
    fn cancellation_reason_only_releases_busy_drivers() {
        let fx = fixture();
        let driver = seed(&fx, OperationalState::Returning);
        let err = fx
            .machine
            .transition(
                driver.id,
                OperationalState::Available,
                TransitionReason::OrderCancelled,
                TransitionContext::by(TriggeredBy::Dispatcher),
            )
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_transition");
    }

    #[test]
    fn vetoed_commit_leaves_no_trace() {
        let fx = fixture();
        let driver = seed(&fx, OperationalState::Offline);
        let result = fx.machine.commit(
            driver.id,
            OperationalState::Available,
            TransitionReason::ShiftStart,
            TransitionContext::by(TriggeredBy::Driver),
            |_, _| Err(DispatchError::InvalidInput("vetoed".to_string())),
        );
        assert!(result.is_err());
        assert_eq!(fx.repo.load_driver(driver.id).unwrap().version, 0);
        assert_eq!(fx.repo.audit().entry_count(driver.id), 0);
    }

    #[test]
    fn break_completion_resets_the_streak_and_accounts_hours() {
        let fx = fixture();
        let driver = seed(&fx, OperationalState::Offline);
        let ctx = TransitionContext::by(TriggeredBy::Driver);

        fx.machine
            .transition(driver.id, OperationalState::Available, TransitionReason::ShiftStart, ctx)
            .unwrap();
        fx.machine
            .update(driver.id, |d| {
                d.consecutive_deliveries = 4;
                Ok(())
            })
            .unwrap();
        fx.clock.advance(Duration::hours(2));
        let on_break = fx
            .machine
            .transition(driver.id, OperationalState::OnBreak, TransitionReason::BreakStarted, ctx)
            .unwrap();
        assert_eq!(on_break.consecutive_deliveries, 4);
        assert!((on_break.hours_worked_today - 2.0).abs() < 1e-6);
        assert!(on_break.on_duty_since.is_none());

        fx.clock.advance(Duration::minutes(30));
        let back = fx
            .machine
            .transition(driver.id, OperationalState::Available, TransitionReason::BreakCompleted, ctx)
            .unwrap();
        assert_eq!(back.consecutive_deliveries, 0);
        assert!((back.hours_worked_today - 2.0).abs() < 1e-6);
        assert!(back.on_duty_since.is_some());
    }

    #[test]
    fn history_timestamps_strictly_increase_under_a_frozen_clock() {
        let fx = fixture();
        let driver = seed(&fx, OperationalState::Offline);
        let ctx = TransitionContext::by(TriggeredBy::Driver);
        for (to, reason) in [
            (OperationalState::Available, TransitionReason::ShiftStart),
            (OperationalState::OnBreak, TransitionReason::BreakStarted),
            (OperationalState::Available, TransitionReason::BreakCompleted),
            (OperationalState::Offline, TransitionReason::ShiftEnd),
        ] {
            fx.machine.transition(driver.id, to, reason, ctx).unwrap();
        }

        let history = fx.repo.transitions(driver.id, &HistoryPage::latest(10));
        assert_eq!(history.len(), 4);
        assert!(history.windows(2).all(|w| w[0].timestamp > w[1].timestamp));
    }

    #[test]
    fn update_cannot_smuggle_a_state_change() {
        let fx = fixture();
        let driver = seed(&fx, OperationalState::Offline);
        let updated = fx
            .machine
            .update(driver.id, |d| {
                d.operational_state = OperationalState::Busy;
                d.is_active = false;
                Ok(())
            })
            .unwrap();
        assert_eq!(updated.operational_state, OperationalState::Offline);
        assert!(!updated.is_active);
        assert_eq!(updated.version, 1);
        assert_eq!(fx.repo.audit().entry_count(driver.id), 0);
    }
}
