//! In-memory bus for tests and for running the daemon without hardware
//!
//! Devices can be attached, detached, and have their readings changed at any
//! time. Faults (corrupted search results, failing reads) can be injected per
//! device.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use thermowire_core::{Address, BusId};
use tracing::trace;

use crate::driver::{BusDriver, DriverError, SensorDriver};

/// Resolution a DS18B20 reports straight after power-up
const POWER_ON_RESOLUTION: u8 = 12;

/// Device placed on a simulated bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedDevice {
    pub bus: BusId,
    pub address: Address,
    #[serde(default)]
    pub celsius: f64,
    /// Device draws power from the data line
    #[serde(default)]
    pub parasite: bool,
}

#[derive(Debug)]
struct SimSensor {
    address: Address,
    celsius: f64,
    parasite: bool,
    resolution: u8,
    conversions: u32,
}

#[derive(Debug, Default)]
struct SimState {
    buses: BTreeMap<BusId, Vec<SimSensor>>,
    begun: HashSet<BusId>,
    /// Addresses whose next search result has a flipped CRC byte
    corrupt_next: HashSet<Address>,
    failing_reads: HashSet<Address>,
    /// Devices that also answer on a second bus
    echoes: BTreeSet<(BusId, Address)>,
    enumerations: HashMap<BusId, u32>,
}

impl SimState {
    fn find(&self, bus: BusId, address: &Address) -> Option<&SimSensor> {
        let on_bus = self
            .buses
            .get(&bus)
            .and_then(|sensors| sensors.iter().find(|s| &s.address == address));
        if on_bus.is_some() || !self.echoes.contains(&(bus, *address)) {
            return on_bus;
        }
        self.buses
            .values()
            .flat_map(|sensors| sensors.iter())
            .find(|s| &s.address == address)
    }

    fn find_mut(&mut self, address: &Address) -> Option<&mut SimSensor> {
        self.buses
            .values_mut()
            .flat_map(|sensors| sensors.iter_mut())
            .find(|s| &s.address == address)
    }
}

/// Simulated 1-Wire buses implementing both driver traits
#[derive(Debug, Default)]
pub struct SimulatedBus {
    state: Mutex<SimState>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a bus pre-populated with devices
    pub fn with_devices(devices: &[SimulatedDevice]) -> Self {
        let sim = Self::new();
        for device in devices {
            sim.attach(device.bus, device.address, device.celsius);
            if device.parasite {
                sim.set_parasite(&device.address, true);
            }
        }
        sim
    }

    /// Place a device on `bus`. Re-attaching moves it.
    pub fn attach(&self, bus: BusId, address: Address, celsius: f64) {
        let mut state = self.state.lock();
        for sensors in state.buses.values_mut() {
            sensors.retain(|s| s.address != address);
        }
        state.buses.entry(bus).or_default().push(SimSensor {
            address,
            celsius,
            parasite: false,
            resolution: POWER_ON_RESOLUTION,
            conversions: 0,
        });
    }

    /// Remove a device from whichever bus holds it
    pub fn detach(&self, address: &Address) -> bool {
        let mut state = self.state.lock();
        let mut removed = false;
        for sensors in state.buses.values_mut() {
            let before = sensors.len();
            sensors.retain(|s| &s.address != address);
            removed |= sensors.len() != before;
        }
        removed
    }

    /// Make an attached device also answer searches and probes on `bus`,
    /// as if two bus ports were wired to the same line
    pub fn echo_on(&self, bus: BusId, address: Address) {
        self.state.lock().echoes.insert((bus, address));
    }

    pub fn set_celsius(&self, address: &Address, celsius: f64) {
        if let Some(sensor) = self.state.lock().find_mut(address) {
            sensor.celsius = celsius;
        }
    }

    pub fn set_parasite(&self, address: &Address, parasite: bool) {
        if let Some(sensor) = self.state.lock().find_mut(address) {
            sensor.parasite = parasite;
        }
    }

    /// The next search on the device's bus returns it with a bad CRC
    pub fn corrupt_next_enumeration(&self, address: Address) {
        self.state.lock().corrupt_next.insert(address);
    }

    pub fn set_failing_reads(&self, address: Address, failing: bool) {
        let mut state = self.state.lock();
        if failing {
            state.failing_reads.insert(address);
        } else {
            state.failing_reads.remove(&address);
        }
    }

    /// Resolution currently configured on the device
    pub fn resolution(&self, address: &Address) -> Option<u8> {
        self.state.lock().find_mut(address).map(|s| s.resolution)
    }

    /// Number of conversions requested from the device
    pub fn conversions(&self, address: &Address) -> u32 {
        self.state
            .lock()
            .find_mut(address)
            .map(|s| s.conversions)
            .unwrap_or(0)
    }

    pub fn is_begun(&self, bus: BusId) -> bool {
        self.state.lock().begun.contains(&bus)
    }

    /// Number of full searches run on `bus`
    pub fn enumerations(&self, bus: BusId) -> u32 {
        self.state
            .lock()
            .enumerations
            .get(&bus)
            .copied()
            .unwrap_or(0)
    }
}

impl BusDriver for SimulatedBus {
    fn begin(&self, bus: BusId) -> Result<(), DriverError> {
        self.state.lock().begun.insert(bus);
        Ok(())
    }

    fn reset_and_enumerate(&self, bus: BusId) -> Result<Vec<Address>, DriverError> {
        let mut state = self.state.lock();
        *state.enumerations.entry(bus).or_default() += 1;

        let mut found: Vec<Address> = state
            .buses
            .get(&bus)
            .map(|sensors| sensors.iter().map(|s| s.address).collect())
            .unwrap_or_default();
        let echoed: Vec<Address> = state
            .echoes
            .iter()
            .filter(|(echo_bus, address)| *echo_bus == bus && !found.contains(address))
            .map(|(_, address)| *address)
            .filter(|address| state.find(bus, address).is_some())
            .collect();
        found.extend(echoed);

        let candidates = found
            .into_iter()
            .map(|address| {
                if state.corrupt_next.remove(&address) {
                    let mut bytes = *address.as_bytes();
                    bytes[7] ^= 0xFF;
                    Address::new(bytes)
                } else {
                    address
                }
            })
            .collect::<Vec<_>>();

        trace!(bus = %bus, count = candidates.len(), "Simulated search");
        Ok(candidates)
    }

    fn probe(&self, bus: BusId, address: &Address) -> Result<bool, DriverError> {
        Ok(self.state.lock().find(bus, address).is_some())
    }
}

impl SensorDriver for SimulatedBus {
    fn is_parasite_powered(&self, bus: BusId) -> Result<bool, DriverError> {
        let state = self.state.lock();
        Ok(state
            .buses
            .get(&bus)
            .map(|sensors| sensors.iter().any(|s| s.parasite))
            .unwrap_or(false))
    }

    fn get_resolution(&self, bus: BusId, address: &Address) -> Result<u8, DriverError> {
        self.state
            .lock()
            .find(bus, address)
            .map(|s| s.resolution)
            .ok_or(DriverError::NotResponding(*address))
    }

    fn set_resolution(&self, bus: BusId, address: &Address, bits: u8) -> Result<(), DriverError> {
        if !(9..=12).contains(&bits) {
            return Err(DriverError::InvalidData(format!(
                "resolution {} outside 9..=12",
                bits
            )));
        }
        let mut state = self.state.lock();
        if state.find(bus, address).is_none() {
            return Err(DriverError::NotResponding(*address));
        }
        if let Some(sensor) = state.find_mut(address) {
            sensor.resolution = bits;
        }
        Ok(())
    }

    fn request_conversion(&self, bus: BusId, address: &Address) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        if state.find(bus, address).is_none() {
            return Err(DriverError::NotResponding(*address));
        }
        if let Some(sensor) = state.find_mut(address) {
            sensor.conversions += 1;
        }
        Ok(())
    }

    fn read_celsius(&self, bus: BusId, address: &Address) -> Result<f64, DriverError> {
        let state = self.state.lock();
        if state.failing_reads.contains(address) {
            return Err(DriverError::NotResponding(*address));
        }
        state
            .find(bus, address)
            .map(|s| s.celsius)
            .ok_or(DriverError::Disconnected(*address))
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self {
            bus: BusId(0),
            address: Address::default(),
            celsius: 0.0,
            parasite: false,
        }
    }
}
