//! Driver operational state machine and SLA-aware dispatch.
//!
//! [`DispatchEngine`] is the entry point. Every driver write goes through
//! [`engine::StateMachine`] as an optimistic, version-checked commit that
//! also appends the audit record; events for a driver are delivered to
//! [`events::EventBus`] subscribers in commit order.

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod geo;
pub mod models;
pub mod observability;
pub mod store;

pub use engine::{DeliveryReport, DispatchConstraints, DispatchEngine};
pub use error::{DispatchError, Result};
