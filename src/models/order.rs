use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::driver::{GeoPoint, ServiceType};

/// Order-side lifecycle. Pickup is tracked here, not as a driver state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Assigned,
    PickedUp,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub fn is_open(self) -> bool {
        matches!(self, OrderStatus::Assigned | OrderStatus::PickedUp)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub status: OrderStatus,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub service_type: ServiceType,
    pub weight_kg: f64,
    pub sla_deadline: DateTime<Utc>,
    pub assigned_driver_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub picked_up_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    /// Bumped by every stored write; see `Repository::commit_order`.
    pub version: u64,
}

impl Order {
    pub fn new(
        pickup: GeoPoint,
        dropoff: GeoPoint,
        service_type: ServiceType,
        sla_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: OrderStatus::Pending,
            pickup,
            dropoff,
            service_type,
            weight_kg: 0.0,
            sla_deadline,
            assigned_driver_id: None,
            created_at: now,
            assigned_at: None,
            picked_up_at: None,
            delivered_at: None,
            version: 0,
        }
    }

    pub fn with_weight(mut self, weight_kg: f64) -> Self {
        self.weight_kg = weight_kg;
        self
    }
}
