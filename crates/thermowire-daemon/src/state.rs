//! Application state management

use anyhow::Result;
use std::sync::Arc;
use thermowire_bus::{SimulatedBus, SysfsBus};
use thermowire_core::{LifecycleEvent, ValueEvent};
use thermowire_discovery::SensorManager;
use tracing::{debug, info, warn};

use crate::config::{Config, DriverKind};

/// Shared application state
pub struct AppState {
    /// The sensor engine
    pub manager: Arc<SensorManager>,
    /// Configuration
    pub config: Config,
}

impl AppState {
    /// Build the engine, register configured buses and names, and attach the
    /// logging subscribers. The engine is not started yet.
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        let engine_config = config.to_engine_config();
        let manager = match config.daemon.driver {
            DriverKind::Simulated => {
                let sim = Arc::new(SimulatedBus::with_devices(&config.simulation.devices));
                info!(
                    devices = config.simulation.devices.len(),
                    "Using simulated buses"
                );
                SensorManager::with_driver(sim, engine_config)
            }
            DriverKind::Sysfs => {
                let bus = match &config.daemon.sysfs_root {
                    Some(root) => SysfsBus::with_root(root),
                    None => SysfsBus::new(),
                };
                info!(root = %bus.root().display(), "Using kernel w1 buses");
                SensorManager::with_driver(Arc::new(bus), engine_config)
            }
        };

        for id in config.bus_ids() {
            manager.add_bus(id).await?;
        }
        for (name, address) in config.named_sensors()? {
            manager.assign_name(&name, address).await?;
        }

        manager.subscribe_lifecycle(|event: &LifecycleEvent| match event {
            LifecycleEvent::Error { name, reason, .. } => {
                warn!(device = %name, reason = %reason, "Sensor error");
            }
            LifecycleEvent::Renamed {
                old_name, new_name, ..
            } => {
                info!(old = %old_name, new = %new_name, "Sensor renamed");
            }
            other => {
                info!(device = %other.name(), event = other.kind(), "Sensor lifecycle");
            }
        })?;
        manager.subscribe_values(|event: &ValueEvent| {
            debug!(device = %event.name, celsius = event.value, "Reading");
        })?;

        Ok(Arc::new(Self { manager, config }))
    }

    /// Start the engine: first reconciliation plus the periodic poller
    pub async fn start(&self) -> Result<()> {
        self.manager.init().await?;
        let count = self.manager.device_count().await?;
        info!(devices = count, "Sensor engine started");
        Ok(())
    }

    /// Stop the poller and drain subscribers off the async runtime
    pub async fn stop(&self) -> Result<()> {
        let manager = self.manager.clone();
        tokio::task::spawn_blocking(move || manager.shutdown()).await?;
        Ok(())
    }
}
