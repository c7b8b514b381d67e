//! Device records tracked by the registry

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::address::Address;

/// Resolution applied to newly discovered sensors, in bits
pub const DEFAULT_RESOLUTION: u8 = 10;

/// Physical connection a bus is attached to (the data pin)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusId(pub u8);

impl fmt::Display for BusId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u8> for BusId {
    fn from(pin: u8) -> Self {
        Self(pin)
    }
}

/// A sensor known to the engine, by logical name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Logical name, unique within the registry
    pub name: String,
    /// Hardware identity, never changes once assigned
    pub address: Address,
    /// Bus the device was last seen on
    pub bus: Option<BusId>,
    /// Whether the device answered the last reconciliation or probe
    pub live: bool,
    pub parasite_powered: bool,
    /// Configured conversion resolution in bits
    pub resolution: u8,
    /// Last reading in °C, rounded to one decimal
    pub value: Option<f64>,
    /// When the record was created
    pub first_seen: DateTime<Utc>,
    /// When the device last answered on a bus
    pub last_seen: Option<DateTime<Utc>>,
}

impl DeviceRecord {
    /// Create a record that has not been seen on any bus yet
    pub fn new(name: impl Into<String>, address: Address) -> Self {
        Self {
            name: name.into(),
            address,
            bus: None,
            live: false,
            parasite_powered: false,
            resolution: DEFAULT_RESOLUTION,
            value: None,
            first_seen: Utc::now(),
            last_seen: None,
        }
    }

    /// Update the last seen timestamp
    pub fn touch(&mut self) {
        self.last_seen = Some(Utc::now());
    }
}

/// Name assigned to a device discovered without a user-provided one
pub fn default_name(address: &Address) -> String {
    format!("T{:016X}", address.packed())
}

/// Round a reading to one decimal place
pub fn round_reading(celsius: f64) -> f64 {
    (celsius * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_starts_unattached() {
        let addr = Address::new([0x28, 1, 2, 3, 4, 5, 6, 7]);
        let record = DeviceRecord::new("boiler", addr);
        assert_eq!(record.name, "boiler");
        assert_eq!(record.bus, None);
        assert!(!record.live);
        assert_eq!(record.resolution, DEFAULT_RESOLUTION);
        assert!(record.last_seen.is_none());
        assert!(record.value.is_none());
    }

    #[test]
    fn test_default_name_is_stable() {
        let addr = Address::new([0x28, 0xFF, 0x4C, 0x7C, 0x0B, 0x16, 0x04, 0xA0]);
        assert_eq!(default_name(&addr), "TA004160B7C4CFF28");
        assert_eq!(default_name(&addr), default_name(&Address::new(*addr.as_bytes())));
    }

    #[test]
    fn test_round_reading() {
        assert_eq!(round_reading(21.04), 21.0);
        assert_eq!(round_reading(21.06), 21.1);
        assert_eq!(round_reading(-10.25), -10.3);
    }
}
