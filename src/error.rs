use thiserror::Error;
use uuid::Uuid;

use crate::models::driver::OperationalState;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid transition for driver {driver_id}: {from} -> {to}")]
    InvalidTransition {
        driver_id: Uuid,
        from: OperationalState,
        to: OperationalState,
    },

    #[error("driver {driver_id} was modified concurrently (expected version {expected}, found {actual})")]
    ConcurrentModification {
        driver_id: Uuid,
        expected: u64,
        actual: u64,
    },

    #[error("order {order_id} was modified concurrently (expected version {expected}, found {actual})")]
    OrderModified {
        order_id: Uuid,
        expected: u64,
        actual: u64,
    },

    #[error("no available driver for order {order_id}")]
    NoAvailableDriver { order_id: Uuid },

    #[error("driver {driver_id} cannot carry {required_kg} kg ({available_kg} kg free)")]
    CapacityExceeded {
        driver_id: Uuid,
        required_kg: f64,
        available_kg: f64,
    },

    #[error("driver {0} not found")]
    DriverNotFound(Uuid),

    #[error("order {0} not found")]
    OrderNotFound(Uuid),

    #[error("order {order_id} is already assigned to driver {driver_id:?}")]
    OrderAlreadyAssigned {
        order_id: Uuid,
        driver_id: Option<Uuid>,
    },

    #[error("order {order_id} is not held by driver {driver_id}")]
    OrderNotHeldByDriver { order_id: Uuid, driver_id: Uuid },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl DispatchError {
    /// Stable machine-readable code for callers that surface errors to users.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::InvalidTransition { .. } => "invalid_transition",
            DispatchError::ConcurrentModification { .. } => "concurrent_modification",
            DispatchError::OrderModified { .. } => "order_modified",
            DispatchError::NoAvailableDriver { .. } => "no_available_driver",
            DispatchError::CapacityExceeded { .. } => "capacity_exceeded",
            DispatchError::DriverNotFound(_) => "driver_not_found",
            DispatchError::OrderNotFound(_) => "order_not_found",
            DispatchError::OrderAlreadyAssigned { .. } => "order_already_assigned",
            DispatchError::OrderNotHeldByDriver { .. } => "order_not_held_by_driver",
            DispatchError::InvalidInput(_) => "invalid_input",
            DispatchError::Configuration(_) => "configuration",
        }
    }

    /// Version conflicts: the write lost a race and may be retried on a
    /// fresh read.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::ConcurrentModification { .. } | DispatchError::OrderModified { .. }
        )
    }

    pub fn driver_id(&self) -> Option<Uuid> {
        match self {
            DispatchError::InvalidTransition { driver_id, .. }
            | DispatchError::ConcurrentModification { driver_id, .. }
            | DispatchError::CapacityExceeded { driver_id, .. }
            | DispatchError::OrderNotHeldByDriver { driver_id, .. } => Some(*driver_id),
            DispatchError::DriverNotFound(id) => Some(*id),
            DispatchError::OrderAlreadyAssigned { driver_id, .. } => *driver_id,
            _ => None,
        }
    }

    pub fn order_id(&self) -> Option<Uuid> {
        match self {
            DispatchError::NoAvailableDriver { order_id }
            | DispatchError::OrderModified { order_id, .. }
            | DispatchError::OrderAlreadyAssigned { order_id, .. }
            | DispatchError::OrderNotHeldByDriver { order_id, .. } => Some(*order_id),
            DispatchError::OrderNotFound(id) => Some(*id),
            _ => None,
        }
    }
}

pub type Result<T, E = DispatchError> = std::result::Result<T, E>;
