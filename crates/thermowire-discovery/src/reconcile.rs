//! Full-topology reconciliation
//!
//! Enumerates every started bus and diffs the result against the registry:
//! new thermometers are added, returning ones restored, and devices that
//! dropped off since the last pass reported lost exactly once.

use std::collections::HashSet;
use thermowire_bus::{BusDriver, SensorDriver};
use thermowire_core::{
    Address, BusId, DeviceFamily, DeviceRecord, DeviceRegistry, ErrorReason, EventBatch,
    LifecycleEvent,
};
use tracing::{debug, info, trace, warn};

use crate::buses::BusRegistry;
use crate::config::EngineConfig;

/// Run one reconciliation pass and return the events it produced
pub fn reconcile(
    registry: &mut DeviceRegistry,
    buses: &mut BusRegistry,
    bus_driver: &dyn BusDriver,
    sensor_driver: &dyn SensorDriver,
    config: &EngineConfig,
) -> EventBatch {
    let mut events = EventBatch::new();
    let inactive = registry.mark_all_active_as_unconfirmed();
    let mut confirmed: HashSet<Address> = HashSet::new();

    for bus in buses.ready(bus_driver) {
        let candidates = match bus_driver.reset_and_enumerate(bus) {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(bus = %bus, error = %e, "Enumeration failed");
                continue;
            }
        };
        debug!(bus = %bus, count = candidates.len(), "Enumerated bus");

        for candidate in candidates {
            if !bus_driver.checksum_valid(&candidate) {
                if let Some(record) = registry.lookup_by_rom(&candidate.rom()) {
                    warn!(device = %record.name, bus = %bus, "Checksum mismatch");
                    events.push_lifecycle(LifecycleEvent::Error {
                        name: record.name.clone(),
                        address: record.address,
                        bus,
                        reason: ErrorReason::ChecksumMismatch,
                    });
                } else {
                    debug!(bus = %bus, candidate = %candidate, "Discarding corrupted search result");
                }
                continue;
            }

            let family = DeviceFamily::detect(&candidate);
            if !family.is_thermometer() {
                trace!(bus = %bus, address = %candidate, family = ?family, "Ignoring device");
                continue;
            }

            let first_in_pass = confirmed.insert(candidate);
            if let Some(event) = attach(registry, candidate, bus, sensor_driver, config, &inactive)
            {
                if first_in_pass {
                    events.push_lifecycle(event);
                }
            }
        }
    }

    for record in registry.iter() {
        if record.live || inactive.contains(&record.name) {
            continue;
        }
        if let Some(bus) = record.bus {
            info!(device = %record.name, bus = %bus, "Device lost");
            events.push_lifecycle(LifecycleEvent::Lost {
                name: record.name.clone(),
                address: record.address,
                bus,
            });
        }
    }

    events
}

/// Mark a found device live on `bus`, creating or configuring it as needed.
///
/// Returns the event the sighting warrants, if any.
fn attach(
    registry: &mut DeviceRegistry,
    address: Address,
    bus: BusId,
    sensor_driver: &dyn SensorDriver,
    config: &EngineConfig,
    inactive: &HashSet<String>,
) -> Option<LifecycleEvent> {
    let (record, created) = registry.upsert_by_address(address);
    let never_attached = record.bus.is_none();
    record.bus = Some(bus);
    record.live = true;
    record.touch();
    if never_attached {
        configure(record, bus, sensor_driver, config);
    }

    let name = record.name.clone();
    if created {
        info!(device = %name, bus = %bus, address = %address, "Device added");
        Some(LifecycleEvent::Added {
            name,
            address,
            bus,
        })
    } else if inactive.contains(&name) {
        info!(device = %name, bus = %bus, "Device restored");
        Some(LifecycleEvent::Restored {
            name,
            address,
            bus,
        })
    } else {
        None
    }
}

/// Read power mode and resolution, then apply the configured resolution
fn configure(
    record: &mut DeviceRecord,
    bus: BusId,
    sensor_driver: &dyn SensorDriver,
    config: &EngineConfig,
) {
    match sensor_driver.is_parasite_powered(bus) {
        Ok(parasite) => record.parasite_powered = parasite,
        Err(e) => warn!(device = %record.name, error = %e, "Failed to read power mode"),
    }
    match sensor_driver.get_resolution(bus, &record.address) {
        Ok(bits) => record.resolution = bits,
        Err(e) => warn!(device = %record.name, error = %e, "Failed to read resolution"),
    }
    match sensor_driver.set_resolution(bus, &record.address, config.default_resolution) {
        Ok(()) => record.resolution = config.default_resolution,
        Err(e) => warn!(device = %record.name, error = %e, "Failed to set resolution"),
    }
    debug!(
        device = %record.name,
        parasite = record.parasite_powered,
        resolution = record.resolution,
        "Configured sensor"
    );
}
