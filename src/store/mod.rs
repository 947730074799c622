pub mod audit;
pub mod memory;

use uuid::Uuid;

use crate::error::Result;
use crate::models::driver::Driver;
use crate::models::order::Order;
use crate::models::sla::SlaViolation;
use crate::models::transition::StateTransition;

pub use audit::{AuditLog, HistoryPage};
pub use memory::InMemoryRepository;

/// Transactional storage seam.
///
/// `commit_driver` is the only way a driver record changes after insertion:
/// it must apply the write only if the stored version still equals
/// `expected_version`, and must append `transition` (when given) in the
/// same atomic step. A version mismatch is reported as
/// [`crate::error::DispatchError::ConcurrentModification`].
///
/// Orders follow the same rule through `commit_order`, reporting
/// [`crate::error::DispatchError::OrderModified`] on a stale version.
pub trait Repository: Send + Sync {
    fn insert_driver(&self, driver: Driver) -> Result<()>;

    fn load_driver(&self, id: Uuid) -> Result<Driver>;

    fn list_drivers(&self) -> Vec<Driver>;

    fn commit_driver(
        &self,
        driver: &Driver,
        expected_version: u64,
        transition: Option<&StateTransition>,
    ) -> Result<()>;

    /// Transitions for one driver, newest first.
    fn transitions(&self, driver_id: Uuid, page: &HistoryPage) -> Vec<StateTransition>;

    fn load_order(&self, id: Uuid) -> Result<Order>;

    fn find_order(&self, id: Uuid) -> Option<Order>;

    /// Stores `order` unless one with the same id exists, and returns
    /// whichever copy is stored afterwards.
    fn insert_order(&self, order: &Order) -> Result<Order>;

    /// Replaces the stored order if its version is still
    /// `expected_version`; the stored copy gets `expected_version + 1`.
    fn commit_order(&self, order: &Order, expected_version: u64) -> Result<Order>;

    fn list_orders(&self) -> Vec<Order>;

    fn save_violation(&self, violation: &SlaViolation) -> Result<()>;

    fn violations(&self) -> Vec<SlaViolation>;
}
