//! Per-tick probe and value refresh
//!
//! A probe cycle never enumerates. Each known device on a started bus is
//! probed directly; live devices have their last conversion read and a new
//! one requested for the next tick.

use thermowire_bus::{BusDriver, SensorDriver, DISCONNECTED_CELSIUS};
use thermowire_core::{
    round_reading, Address, BusId, DeviceRegistry, ErrorReason, EventBatch, LifecycleEvent,
    ValueEvent,
};
use tracing::{debug, info, trace, warn};

use crate::buses::BusRegistry;

/// Run one probe cycle over every device on a ready bus
pub fn poll(
    registry: &mut DeviceRegistry,
    buses: &mut BusRegistry,
    bus_driver: &dyn BusDriver,
    sensor_driver: &dyn SensorDriver,
) -> EventBatch {
    let mut events = EventBatch::new();
    let ready = buses.ready(bus_driver);

    for (name, address, bus) in attached(registry, &ready) {
        let present = match bus_driver.probe(bus, &address) {
            Ok(present) => present,
            Err(e) => {
                debug!(device = %name, bus = %bus, error = %e, "Probe failed");
                false
            }
        };

        let was_live = match registry.update(&name, |record| {
            if present {
                record.touch();
            }
            std::mem::replace(&mut record.live, present)
        }) {
            Ok(was_live) => was_live,
            Err(e) => {
                warn!(device = %name, error = %e, "Device vanished during poll");
                continue;
            }
        };

        match (was_live, present) {
            (false, true) => {
                info!(device = %name, bus = %bus, "Device restored");
                events.push_lifecycle(LifecycleEvent::Restored {
                    name: name.clone(),
                    address,
                    bus,
                });
            }
            (true, false) => {
                info!(device = %name, bus = %bus, "Device lost");
                events.push_lifecycle(LifecycleEvent::Lost {
                    name: name.clone(),
                    address,
                    bus,
                });
            }
            _ => {}
        }

        if present {
            refresh_value(registry, &name, address, bus, sensor_driver, &mut events);
        }
    }

    events
}

/// Ask every live device on a ready bus to start a conversion
pub fn request_conversions(
    registry: &DeviceRegistry,
    buses: &mut BusRegistry,
    bus_driver: &dyn BusDriver,
    sensor_driver: &dyn SensorDriver,
) {
    let ready = buses.ready(bus_driver);
    for record in registry.iter().filter(|r| r.live) {
        let Some(bus) = record.bus.filter(|bus| ready.contains(bus)) else {
            continue;
        };
        if let Err(e) = sensor_driver.request_conversion(bus, &record.address) {
            warn!(device = %record.name, error = %e, "Failed to request conversion");
        }
    }
}

/// Devices attached to one of `ready`, as owned keys
fn attached(registry: &DeviceRegistry, ready: &[BusId]) -> Vec<(String, Address, BusId)> {
    registry
        .iter()
        .filter_map(|record| {
            let bus = record.bus.filter(|bus| ready.contains(bus))?;
            Some((record.name.clone(), record.address, bus))
        })
        .collect()
}

fn refresh_value(
    registry: &mut DeviceRegistry,
    name: &str,
    address: Address,
    bus: BusId,
    sensor_driver: &dyn SensorDriver,
    events: &mut EventBatch,
) {
    let reading = match sensor_driver.read_celsius(bus, &address) {
        Ok(celsius) if celsius == DISCONNECTED_CELSIUS => {
            Err("device reported disconnected".to_string())
        }
        Ok(celsius) if !celsius.is_finite() => Err(format!("non-finite reading {}", celsius)),
        Ok(celsius) => Ok(round_reading(celsius)),
        Err(e) => Err(e.to_string()),
    };

    match reading {
        Ok(value) => {
            let changed = registry
                .update(name, |record| {
                    if record.value == Some(value) {
                        false
                    } else {
                        record.value = Some(value);
                        true
                    }
                })
                .unwrap_or(false);
            if changed {
                trace!(device = %name, value, "Value changed");
                events.push_value(ValueEvent {
                    name: name.to_string(),
                    address,
                    value,
                });
            }
        }
        Err(detail) => {
            warn!(device = %name, bus = %bus, error = %detail, "Read failed");
            events.push_lifecycle(LifecycleEvent::Error {
                name: name.to_string(),
                address,
                bus,
                reason: ErrorReason::ReadFailed(detail),
            });
        }
    }

    if let Err(e) = sensor_driver.request_conversion(bus, &address) {
        warn!(device = %name, error = %e, "Failed to request conversion");
    }
}
