use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::models::driver::Driver;
use crate::models::order::Order;
use crate::models::sla::SlaViolation;
use crate::models::transition::StateTransition;
use crate::store::audit::{AuditLog, HistoryPage};
use crate::store::Repository;

/// DashMap-backed repository. The per-key shard lock taken by `get_mut`
/// is the commit boundary: version check, record swap and audit append all
/// happen while it is held.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    drivers: DashMap<Uuid, Driver>,
    orders: DashMap<Uuid, Order>,
    violations: DashMap<Uuid, SlaViolation>,
    audit: AuditLog,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }
}

impl Repository for InMemoryRepository {
    fn insert_driver(&self, driver: Driver) -> Result<()> {
        match self.drivers.entry(driver.id) {
            Entry::Occupied(_) => Err(DispatchError::InvalidInput(format!(
                "driver {} already registered",
                driver.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(driver);
                Ok(())
            }
        }
    }

    fn load_driver(&self, id: Uuid) -> Result<Driver> {
        self.drivers
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(DispatchError::DriverNotFound(id))
    }

    fn list_drivers(&self) -> Vec<Driver> {
        self.drivers
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn commit_driver(
        &self,
        driver: &Driver,
        expected_version: u64,
        transition: Option<&StateTransition>,
    ) -> Result<()> {
        let mut stored = self
            .drivers
            .get_mut(&driver.id)
            .ok_or(DispatchError::DriverNotFound(driver.id))?;

        if stored.version != expected_version {
            return Err(DispatchError::ConcurrentModification {
                driver_id: driver.id,
                expected: expected_version,
                actual: stored.version,
            });
        }

        if let Some(transition) = transition {
            self.audit.append(transition.clone());
        }
        *stored = driver.clone();

        Ok(())
    }

    fn transitions(&self, driver_id: Uuid, page: &HistoryPage) -> Vec<StateTransition> {
        self.audit.history(driver_id, page)
    }

    fn load_order(&self, id: Uuid) -> Result<Order> {
        self.find_order(id).ok_or(DispatchError::OrderNotFound(id))
    }

    fn find_order(&self, id: Uuid) -> Option<Order> {
        self.orders.get(&id).map(|entry| entry.value().clone())
    }

    fn insert_order(&self, order: &Order) -> Result<Order> {
        let stored = self
            .orders
            .entry(order.id)
            .or_insert_with(|| order.clone())
            .value()
            .clone();
        Ok(stored)
    }

    fn commit_order(&self, order: &Order, expected_version: u64) -> Result<Order> {
        let mut stored = self
            .orders
            .get_mut(&order.id)
            .ok_or(DispatchError::OrderNotFound(order.id))?;

        if stored.version != expected_version {
            return Err(DispatchError::OrderModified {
                order_id: order.id,
                expected: expected_version,
                actual: stored.version,
            });
        }

        let mut next = order.clone();
        next.version = expected_version + 1;
        *stored = next.clone();
        Ok(next)
    }

    fn list_orders(&self) -> Vec<Order> {
        self.orders
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn save_violation(&self, violation: &SlaViolation) -> Result<()> {
        self.violations.insert(violation.order_id, violation.clone());
        Ok(())
    }

    fn violations(&self) -> Vec<SlaViolation> {
        self.violations
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }
}
