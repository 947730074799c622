pub mod availability;
pub mod dispatch;
pub mod fleet;
pub mod lifecycle;
pub mod scoring;
pub mod sla;
pub mod state_machine;

pub use availability::{AvailabilityCheck, AvailabilityEngine, UnavailableReason};
pub use dispatch::{DispatchConstraints, DispatchEngine, EngineBuilder};
pub use fleet::{FleetStatus, MaintenanceReport, OrderRisk};
pub use lifecycle::DeliveryReport;
pub use sla::{SlaMonitor, SlaSummary};
pub use state_machine::{StateMachine, TransitionContext};
