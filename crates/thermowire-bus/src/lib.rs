//! Thermowire Bus - 1-Wire bus and sensor drivers
//!
//! This crate defines the driver interfaces the engine talks to and
//! provides two implementations:
//! - `SimulatedBus`, an in-memory bus with fault injection
//! - `SysfsBus`, backed by the Linux kernel `w1` subsystem

pub mod crc;
pub mod driver;
pub mod sim;
pub mod sysfs;

pub use crc::{address_crc_valid, complete_address, crc8};
pub use driver::{BusDriver, DriverError, SensorDriver, DISCONNECTED_CELSIUS};
pub use sim::{SimulatedBus, SimulatedDevice};
pub use sysfs::SysfsBus;
