//! Linux kernel `w1` subsystem backend
//!
//! The kernel runs the ROM search itself and exposes the result under
//! `/sys/bus/w1/devices`:
//!
//! ```text
//! w1_bus_master1/w1_master_slaves   one slave id per line, or "not found."
//! w1_bus_master1/28-0316a2797bff/   one directory per slave
//!     w1_slave                      scratchpad dump with "crc=.. YES" and "t=21500"
//!     resolution                    9..12 (newer kernels)
//!     ext_power                     1 = external supply, 0 = parasite
//! ```
//!
//! Bus `N` maps to `w1_bus_masterN`. Slave ids carry family and serial only,
//! so the CRC byte is recomputed when building the address.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use thermowire_core::{Address, BusId};
use tracing::{debug, trace};

use crate::crc::complete_address;
use crate::driver::{BusDriver, DriverError, SensorDriver};

/// Default sysfs location of 1-Wire devices
pub const W1_DEVICES_ROOT: &str = "/sys/bus/w1/devices";

/// Bus and sensor driver backed by the kernel `w1` sysfs tree
#[derive(Debug, Clone)]
pub struct SysfsBus {
    root: PathBuf,
}

impl Default for SysfsBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SysfsBus {
    pub fn new() -> Self {
        Self::with_root(W1_DEVICES_ROOT)
    }

    /// Use a different devices directory (tests, chroots)
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn master_dir(&self, bus: BusId) -> PathBuf {
        self.root.join(format!("w1_bus_master{}", bus.0))
    }

    fn slave_dir(&self, bus: BusId, address: &Address) -> PathBuf {
        self.master_dir(bus).join(slave_id(address))
    }

    fn existing_master(&self, bus: BusId) -> Result<PathBuf, DriverError> {
        let dir = self.master_dir(bus);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(DriverError::NoSuchBus(bus))
        }
    }

    fn existing_slave(&self, bus: BusId, address: &Address) -> Result<PathBuf, DriverError> {
        let dir = self.slave_dir(bus, address);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(DriverError::Disconnected(*address))
        }
    }
}

impl BusDriver for SysfsBus {
    fn begin(&self, bus: BusId) -> Result<(), DriverError> {
        let dir = self.existing_master(bus)?;
        debug!(bus = %bus, path = %dir.display(), "Using kernel 1-Wire master");
        Ok(())
    }

    fn reset_and_enumerate(&self, bus: BusId) -> Result<Vec<Address>, DriverError> {
        let dir = self.existing_master(bus)?;
        let listing = read_trimmed(dir.join("w1_master_slaves"))?;

        let mut found = Vec::new();
        for line in listing.lines().map(str::trim) {
            if line.is_empty() || line == "not found." {
                continue;
            }
            match parse_slave_id(line) {
                Some(address) => found.push(address),
                None => trace!(bus = %bus, entry = %line, "Skipping unparsable slave id"),
            }
        }
        Ok(found)
    }

    fn probe(&self, bus: BusId, address: &Address) -> Result<bool, DriverError> {
        Ok(self.slave_dir(bus, address).is_dir())
    }
}

impl SensorDriver for SysfsBus {
    fn is_parasite_powered(&self, bus: BusId) -> Result<bool, DriverError> {
        let dir = self.existing_master(bus)?;
        let Ok(entries) = fs::read_dir(&dir) else {
            return Ok(false);
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if let Ok(power) = read_trimmed(path.join("ext_power")) {
                if power == "0" {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn get_resolution(&self, bus: BusId, address: &Address) -> Result<u8, DriverError> {
        let dir = self.existing_slave(bus, address)?;
        let raw = read_trimmed(dir.join("resolution"))?;
        raw.parse()
            .map_err(|_| DriverError::InvalidData(format!("resolution {:?}", raw)))
    }

    fn set_resolution(&self, bus: BusId, address: &Address, bits: u8) -> Result<(), DriverError> {
        let dir = self.existing_slave(bus, address)?;
        fs::write(dir.join("resolution"), bits.to_string())?;
        Ok(())
    }

    fn request_conversion(&self, bus: BusId, address: &Address) -> Result<(), DriverError> {
        // The kernel converts on every read of w1_slave
        self.existing_slave(bus, address)?;
        Ok(())
    }

    fn read_celsius(&self, bus: BusId, address: &Address) -> Result<f64, DriverError> {
        let dir = self.existing_slave(bus, address)?;
        let dump = read_trimmed(dir.join("w1_slave"))?;
        parse_w1_slave(&dump)
    }
}

/// Kernel slave id: family, dash, serial as a 48-bit big-endian number
pub fn slave_id(address: &Address) -> String {
    let bytes = address.as_bytes();
    let serial = bytes[1..7]
        .iter()
        .rev()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b));
    format!("{:02x}-{:012x}", bytes[0], serial)
}

/// Inverse of [`slave_id`], recomputing the CRC byte
pub fn parse_slave_id(id: &str) -> Option<Address> {
    let (family, serial) = id.split_once('-')?;
    if family.len() != 2 || serial.len() != 12 {
        return None;
    }
    let family = u8::from_str_radix(family, 16).ok()?;
    let serial = u64::from_str_radix(serial, 16).ok()?;

    let mut rom = [0u8; 7];
    rom[0] = family;
    for (i, byte) in rom[1..].iter_mut().enumerate() {
        *byte = (serial >> (8 * i)) as u8;
    }
    Some(complete_address(rom))
}

/// Extract the temperature from a `w1_slave` dump
fn parse_w1_slave(dump: &str) -> Result<f64, DriverError> {
    let mut lines = dump.lines();
    let crc_line = lines
        .next()
        .ok_or_else(|| DriverError::InvalidData("empty w1_slave".to_string()))?;
    if !crc_line.trim_end().ends_with("YES") {
        return Err(DriverError::InvalidData("scratchpad CRC check failed".to_string()));
    }

    let data_line = lines
        .next()
        .ok_or_else(|| DriverError::InvalidData("missing temperature line".to_string()))?;
    let (_, millis) = data_line
        .rsplit_once("t=")
        .ok_or_else(|| DriverError::InvalidData("missing t= field".to_string()))?;
    let millis: i64 = millis
        .trim()
        .parse()
        .map_err(|_| DriverError::InvalidData(format!("temperature {:?}", millis)))?;
    Ok(millis as f64 / 1000.0)
}

fn read_trimmed<P: AsRef<Path>>(p: P) -> io::Result<String> {
    let mut s = String::new();
    fs::File::open(p)?.read_to_string(&mut s)?;
    Ok(s.trim().to_string())
}
