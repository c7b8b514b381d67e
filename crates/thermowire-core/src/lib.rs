//! Thermowire Core - Core types, address codec, and device registry
//!
//! This crate provides the foundational types for the Thermowire system:
//! - 1-Wire ROM address parsing and formatting
//! - Device family classification
//! - Device records and the name-keyed registry
//! - Lifecycle and value events

pub mod address;
pub mod device;
pub mod event;
pub mod family;
pub mod registry;

pub use address::{format_address, parse_address, Address, AddressParseError};
pub use device::{default_name, round_reading, BusId, DeviceRecord, DEFAULT_RESOLUTION};
pub use event::{EngineEvent, ErrorReason, EventBatch, LifecycleEvent, ValueEvent};
pub use family::{DeviceFamily, ThermometerModel};
pub use registry::{DeviceRegistry, RegistryError};
