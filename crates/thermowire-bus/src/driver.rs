//! Interfaces to the physical bus and to the sensors on it

use thermowire_core::{Address, BusId};
use thiserror::Error;

use crate::crc::address_crc_valid;

/// Reading reported by DS18x20 libraries when a device drops off mid-read
pub const DISCONNECTED_CELSIUS: f64 = -127.0;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Bus {0} is not available")]
    NoSuchBus(BusId),
    #[error("Device {0} did not respond")]
    NotResponding(Address),
    #[error("Device {0} is disconnected")]
    Disconnected(Address),
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Bus-level transactions: reset, ROM search and presence checks.
///
/// Implementations may block; the engine only calls them from blocking
/// worker threads.
pub trait BusDriver: Send + Sync {
    /// Prepare the bus for use. Called once per bus after the engine starts.
    fn begin(&self, bus: BusId) -> Result<(), DriverError> {
        let _ = bus;
        Ok(())
    }

    /// Reset the bus and run a full ROM search, returning the raw candidates
    /// in the order the search found them.
    fn reset_and_enumerate(&self, bus: BusId) -> Result<Vec<Address>, DriverError>;

    /// Check the candidate's CRC byte
    fn checksum_valid(&self, candidate: &Address) -> bool {
        address_crc_valid(candidate)
    }

    /// Targeted presence check for one device
    fn probe(&self, bus: BusId, address: &Address) -> Result<bool, DriverError>;
}

/// Temperature-sensor commands. Every call is a transaction on `bus`.
pub trait SensorDriver: Send + Sync {
    /// Whether any device on the bus runs on parasite power
    fn is_parasite_powered(&self, bus: BusId) -> Result<bool, DriverError>;

    fn get_resolution(&self, bus: BusId, address: &Address) -> Result<u8, DriverError>;

    fn set_resolution(&self, bus: BusId, address: &Address, bits: u8) -> Result<(), DriverError>;

    /// Start a conversion; the result is read on the next cycle
    fn request_conversion(&self, bus: BusId, address: &Address) -> Result<(), DriverError>;

    /// Read the last converted temperature in °C
    fn read_celsius(&self, bus: BusId, address: &Address) -> Result<f64, DriverError>;
}
