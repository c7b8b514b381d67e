//! Registered buses, keyed by connection id

use serde::Serialize;
use std::collections::BTreeMap;
use thermowire_bus::BusDriver;
use thermowire_core::BusId;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};

/// A registered bus
#[derive(Debug, Clone, Serialize)]
pub struct BusHandle {
    pub id: BusId,
    /// The driver's `begin` has succeeded for this bus
    pub initialized: bool,
}

/// The set of buses the engine scans.
///
/// Buses added before [`BusRegistry::start`] are initialized when the engine
/// starts; buses added afterwards are initialized immediately. A bus whose
/// initialization failed is retried the next time it is used.
#[derive(Debug, Default)]
pub struct BusRegistry {
    buses: BTreeMap<BusId, BusHandle>,
    started: bool,
}

impl BusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn contains(&self, id: BusId) -> bool {
        self.buses.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.buses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buses.is_empty()
    }

    pub fn handles(&self) -> Vec<BusHandle> {
        self.buses.values().cloned().collect()
    }

    pub fn add(&mut self, id: BusId, driver: &dyn BusDriver) -> Result<()> {
        if self.buses.contains_key(&id) {
            return Err(EngineError::DuplicateBus(id));
        }
        let mut handle = BusHandle {
            id,
            initialized: false,
        };
        if self.started {
            initialize(&mut handle, driver);
        }
        self.buses.insert(id, handle);
        info!(bus = %id, "Bus added");
        Ok(())
    }

    pub fn remove(&mut self, id: BusId) -> Result<BusHandle> {
        let handle = self.buses.remove(&id).ok_or(EngineError::UnknownBus(id))?;
        info!(bus = %id, "Bus removed");
        Ok(handle)
    }

    /// Mark the collection started and initialize every bus
    pub fn start(&mut self, driver: &dyn BusDriver) {
        self.started = true;
        for handle in self.buses.values_mut() {
            if !handle.initialized {
                initialize(handle, driver);
            }
        }
    }

    /// Buses usable right now, in ascending id order.
    ///
    /// Nothing is usable before the collection is started. Buses that have
    /// not been initialized yet get another attempt here.
    pub fn ready(&mut self, driver: &dyn BusDriver) -> Vec<BusId> {
        if !self.started {
            return Vec::new();
        }
        self.buses
            .values_mut()
            .filter_map(|handle| {
                if !handle.initialized {
                    initialize(handle, driver);
                }
                handle.initialized.then_some(handle.id)
            })
            .collect()
    }
}

fn initialize(handle: &mut BusHandle, driver: &dyn BusDriver) {
    match driver.begin(handle.id) {
        Ok(()) => {
            debug!(bus = %handle.id, "Bus initialized");
            handle.initialized = true;
        }
        Err(e) => {
            warn!(bus = %handle.id, error = %e, "Failed to initialize bus");
        }
    }
}
