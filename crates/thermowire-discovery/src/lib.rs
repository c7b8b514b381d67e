//! Thermowire Discovery - sensor presence reconciliation and notification
//!
//! The [`SensorManager`] keeps a registry of named temperature sensors in
//! step with what the buses report:
//! - full reconciliation passes enumerate every bus on demand
//! - a periodic probe cycle checks presence and refreshes readings
//! - lifecycle and value changes are fanned out to subscribers

pub mod buses;
pub mod config;
pub mod error;
pub mod manager;
pub mod notifier;
pub mod poller;
pub mod reconcile;
pub mod scheduler;

pub use buses::{BusHandle, BusRegistry};
pub use config::{EngineConfig, DEFAULT_POLL_INTERVAL_MS};
pub use error::{EngineError, Result};
pub use manager::SensorManager;
pub use notifier::{
    LifecycleSubscriber, Notifier, SubscriptionId, ValueSubscriber, SHUTDOWN_GRACE,
};
pub use scheduler::PeriodicTask;

pub use thermowire_core::{format_address, parse_address, Address, AddressParseError};
