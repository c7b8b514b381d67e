//! Device family classification from the ROM family byte

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::address::Address;

/// Known thermometer models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThermometerModel {
    Ds18s20,
    Ds18b20,
    Ds1822,
    Ds1825,
    Ds28ea00,
}

impl ThermometerModel {
    pub const fn family_code(self) -> u8 {
        match self {
            Self::Ds18s20 => 0x10,
            Self::Ds18b20 => 0x28,
            Self::Ds1822 => 0x22,
            Self::Ds1825 => 0x3B,
            Self::Ds28ea00 => 0x42,
        }
    }
}

impl fmt::Display for ThermometerModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ds18s20 => "DS18S20",
            Self::Ds18b20 => "DS18B20",
            Self::Ds1822 => "DS1822",
            Self::Ds1825 => "DS1825",
            Self::Ds28ea00 => "DS28EA00",
        };
        f.write_str(name)
    }
}

/// Family of a device found on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceFamily {
    /// A temperature sensor the engine manages
    Thermometer(ThermometerModel),
    /// Anything else; enumerated but not tracked
    Generic(u8),
}

impl DeviceFamily {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x10 => Self::Thermometer(ThermometerModel::Ds18s20),
            0x28 => Self::Thermometer(ThermometerModel::Ds18b20),
            0x22 => Self::Thermometer(ThermometerModel::Ds1822),
            0x3B => Self::Thermometer(ThermometerModel::Ds1825),
            0x42 => Self::Thermometer(ThermometerModel::Ds28ea00),
            other => Self::Generic(other),
        }
    }

    pub fn detect(address: &Address) -> Self {
        Self::from_code(address.family_code())
    }

    pub fn is_thermometer(&self) -> bool {
        matches!(self, Self::Thermometer(_))
    }
}
