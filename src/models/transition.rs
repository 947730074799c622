use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::driver::OperationalState;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    ShiftStart,
    OrderAssigned,
    OrderCancelled,
    DeliveryCompletedNear,
    DeliveryCompletedFar,
    ReturnedToZone,
    BreakNeeded,
    BreakStarted,
    BreakCompleted,
    ShiftEnd,
    Emergency,
}

impl TransitionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TransitionReason::ShiftStart => "shift_start",
            TransitionReason::OrderAssigned => "order_assigned",
            TransitionReason::OrderCancelled => "order_cancelled",
            TransitionReason::DeliveryCompletedNear => "delivery_completed_near",
            TransitionReason::DeliveryCompletedFar => "delivery_completed_far",
            TransitionReason::ReturnedToZone => "returned_to_zone",
            TransitionReason::BreakNeeded => "break_needed",
            TransitionReason::BreakStarted => "break_started",
            TransitionReason::BreakCompleted => "break_completed",
            TransitionReason::ShiftEnd => "shift_end",
            TransitionReason::Emergency => "emergency",
        }
    }
}

impl fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    Driver,
    Dispatcher,
    System,
}

/// Audit record of one committed state change. Never mutated after append.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateTransition {
    pub driver_id: Uuid,
    pub from_state: OperationalState,
    pub to_state: OperationalState,
    pub reason: TransitionReason,
    pub triggered_by: TriggeredBy,
    pub order_id: Option<Uuid>,
    /// Driver version produced by this transition.
    pub version: u64,
    pub timestamp: DateTime<Utc>,
}
