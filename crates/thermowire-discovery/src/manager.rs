//! The sensor manager: one engine instance owning the registry, the buses
//! and the background poller.
//!
//! All engine state sits behind a single lock. Each operation takes the lock
//! on a blocking worker thread and collects the events it produces. The batch
//! is queued with the notifier before the lock is released, so subscribers
//! see batches in the order the state changed. Queueing never runs subscriber
//! code.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thermowire_bus::{BusDriver, SensorDriver};
use thermowire_core::{
    Address, BusId, DeviceRecord, DeviceRegistry, EngineEvent, EventBatch, LifecycleEvent,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::buses::{BusHandle, BusRegistry};
use crate::config::{EngineConfig, MIN_POLL_INTERVAL_MS};
use crate::error::{EngineError, Result};
use crate::notifier::{LifecycleSubscriber, Notifier, SubscriptionId, ValueSubscriber};
use crate::poller::{poll, request_conversions};
use crate::reconcile::reconcile;
use crate::scheduler::PeriodicTask;

struct EngineState {
    registry: DeviceRegistry,
    buses: BusRegistry,
    config: EngineConfig,
}

pub struct SensorManager {
    state: Arc<Mutex<EngineState>>,
    bus_driver: Arc<dyn BusDriver>,
    sensor_driver: Arc<dyn SensorDriver>,
    notifier: Arc<Notifier>,
    scheduler: Mutex<Option<PeriodicTask>>,
    poll_interval_ms: AtomicU64,
}

impl SensorManager {
    pub fn new(
        bus_driver: Arc<dyn BusDriver>,
        sensor_driver: Arc<dyn SensorDriver>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let poll_interval_ms = config.poll_interval_ms.max(MIN_POLL_INTERVAL_MS);
        Arc::new(Self {
            state: Arc::new(Mutex::new(EngineState {
                registry: DeviceRegistry::new(),
                buses: BusRegistry::new(),
                config,
            })),
            bus_driver,
            sensor_driver,
            notifier: Arc::new(Notifier::new()),
            scheduler: Mutex::new(None),
            poll_interval_ms: AtomicU64::new(poll_interval_ms),
        })
    }

    /// Build a manager around a driver that handles both bus and sensor
    /// commands
    pub fn with_driver<D>(driver: Arc<D>, config: EngineConfig) -> Arc<Self>
    where
        D: BusDriver + SensorDriver + 'static,
    {
        let bus_driver: Arc<dyn BusDriver> = driver.clone();
        let sensor_driver: Arc<dyn SensorDriver> = driver;
        Self::new(bus_driver, sensor_driver, config)
    }

    /// Start the buses, run the first reconciliation, kick off conversions
    /// and start the periodic poller.
    ///
    /// Calling it again reruns the reconciliation; the poller is only
    /// started once.
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        info!("Starting sensor manager");
        self.exclusive_with_events(|state, bus, sensor, events| {
            state.buses.start(bus);
            events.extend(reconcile(
                &mut state.registry,
                &mut state.buses,
                bus,
                sensor,
                &state.config,
            ));
            request_conversions(&state.registry, &mut state.buses, bus, sensor);
        })
        .await?;
        self.start_polling();
        Ok(())
    }

    pub async fn add_bus(&self, id: BusId) -> Result<()> {
        self.exclusive(move |state, bus, _| state.buses.add(id, bus))
            .await?
    }

    pub async fn remove_bus(&self, id: BusId) -> Result<()> {
        self.exclusive(move |state, _, _| state.buses.remove(id).map(|_| ()))
            .await?
    }

    pub async fn buses(&self) -> Result<Vec<BusHandle>> {
        self.exclusive(|state, _, _| state.buses.handles()).await
    }

    /// Give `address` the logical name `name`.
    ///
    /// A known device is renamed and marked not live until the next cycle
    /// confirms it. An unknown address is registered and a full
    /// reconciliation runs to locate it.
    pub async fn assign_name(&self, name: &str, address: Address) -> Result<()> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(EngineError::EmptyName);
        }

        self.exclusive_with_events(move |state, bus, sensor, events| -> Result<()> {
            let existing = state
                .registry
                .lookup_by_address(&address)
                .map(|record| (record.name.clone(), record.bus));

            if let Some((old_name, _)) = &existing {
                if *old_name == name {
                    debug!(device = %name, "Name already assigned");
                    return Ok(());
                }
            }
            if state.registry.contains(&name) {
                return Err(EngineError::NameInUse(name));
            }

            match existing {
                Some((old_name, bus_id)) => {
                    state.registry.rename(&old_name, &name)?;
                    state.registry.set_liveness(&name, false)?;
                    info!(old = %old_name, new = %name, "Device renamed");

                    events.push_lifecycle(LifecycleEvent::Renamed {
                        old_name,
                        new_name: name,
                        address,
                        bus: bus_id,
                    });
                }
                None => {
                    state
                        .registry
                        .insert(DeviceRecord::new(name.clone(), address))?;
                    info!(device = %name, address = %address, "Device registered");
                    events.extend(reconcile(
                        &mut state.registry,
                        &mut state.buses,
                        bus,
                        sensor,
                        &state.config,
                    ));
                }
            }
            Ok(())
        })
        .await?
    }

    /// Run a full reconciliation now and return the resulting device list
    pub async fn search_devices(&self) -> Result<Vec<DeviceRecord>> {
        self.exclusive_with_events(|state, bus, sensor, events| {
            events.extend(reconcile(
                &mut state.registry,
                &mut state.buses,
                bus,
                sensor,
                &state.config,
            ));
            state.registry.snapshot()
        })
        .await
    }

    /// Run one probe and value refresh cycle
    pub async fn poll_once(&self) -> Result<()> {
        self.exclusive_with_events(|state, bus, sensor, events| {
            events.extend(poll(&mut state.registry, &mut state.buses, bus, sensor));
        })
        .await
    }

    /// Change the poll period. Takes effect from the next tick.
    pub fn set_poll_interval(&self, period: Duration) {
        let ms = u64::try_from(period.as_millis())
            .unwrap_or(u64::MAX)
            .max(MIN_POLL_INTERVAL_MS);
        self.poll_interval_ms.store(ms, Ordering::Relaxed);
        if let Some(scheduler) = self.scheduler.lock().as_ref() {
            scheduler.set_period(Duration::from_millis(ms));
        }
        info!(period_ms = ms, "Poll interval updated");
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.load(Ordering::Relaxed))
    }

    pub fn is_polling(&self) -> bool {
        self.scheduler
            .lock()
            .as_ref()
            .map(PeriodicTask::is_running)
            .unwrap_or(false)
    }

    pub async fn device_count(&self) -> Result<usize> {
        self.exclusive(|state, _, _| state.registry.len()).await
    }

    /// All devices in name order
    pub async fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
        self.exclusive(|state, _, _| state.registry.snapshot()).await
    }

    pub async fn get_device(&self, name: &str) -> Result<Option<DeviceRecord>> {
        let name = name.to_string();
        self.exclusive(move |state, _, _| state.registry.get(&name).cloned())
            .await
    }

    pub fn subscribe_lifecycle(
        &self,
        subscriber: impl LifecycleSubscriber,
    ) -> Result<SubscriptionId> {
        self.notifier.subscribe_lifecycle(subscriber)
    }

    pub fn subscribe_values(&self, subscriber: impl ValueSubscriber) -> Result<SubscriptionId> {
        self.notifier.subscribe_values(subscriber)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.notifier.unsubscribe(id)
    }

    /// Subscribe to the combined event stream
    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.notifier.events()
    }

    /// Stop the poller and drain every subscriber.
    ///
    /// Blocks for at most [`SHUTDOWN_GRACE`](crate::notifier::SHUTDOWN_GRACE);
    /// a subscriber that never returns is detached.
    pub fn shutdown(&self) {
        if let Some(scheduler) = self.scheduler.lock().take() {
            scheduler.stop();
        }
        self.notifier.shutdown();
        info!("Sensor manager stopped");
    }

    fn start_polling(self: &Arc<Self>) {
        let mut scheduler = self.scheduler.lock();
        if scheduler.is_some() {
            return;
        }

        let manager = Arc::downgrade(self);
        *scheduler = Some(PeriodicTask::spawn(self.poll_interval(), move || {
            let manager = manager.clone();
            async move {
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                if let Err(e) = manager.poll_once().await {
                    warn!(error = %e, "Poll cycle failed");
                }
            }
        }));
        debug!(period_ms = self.poll_interval_ms.load(Ordering::Relaxed), "Poller started");
    }

    /// Run `f` with exclusive access to the engine state on a blocking thread
    async fn exclusive<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut EngineState, &dyn BusDriver, &dyn SensorDriver) -> R + Send + 'static,
        R: Send + 'static,
    {
        let state = self.state.clone();
        let bus_driver = self.bus_driver.clone();
        let sensor_driver = self.sensor_driver.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut state = state.lock();
            f(&mut *state, bus_driver.as_ref(), sensor_driver.as_ref())
        })
        .await?;
        Ok(result)
    }

    /// Like [`Self::exclusive`], and queues the events `f` collects with the
    /// notifier before the lock is released
    async fn exclusive_with_events<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut EngineState, &dyn BusDriver, &dyn SensorDriver, &mut EventBatch) -> R
            + Send
            + 'static,
        R: Send + 'static,
    {
        let notifier = self.notifier.clone();
        self.exclusive(move |state, bus, sensor| {
            let mut events = EventBatch::new();
            let result = f(state, bus, sensor, &mut events);
            notifier.dispatch(events);
            result
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Mutex as StdMutex;
    use thermowire_bus::{complete_address, DriverError, SimulatedBus};
    use tokio::sync::oneshot;
    use thermowire_core::{ErrorReason, ValueEvent};

    fn sensor(n: u8) -> Address {
        complete_address([0x28, n, 0x4C, 0x7C, 0x0B, 0x16, 0x04])
    }

    async fn engine(buses: &[u8]) -> (Arc<SimulatedBus>, Arc<SensorManager>) {
        let sim = Arc::new(SimulatedBus::new());
        let manager = SensorManager::with_driver(sim.clone(), EngineConfig::default());
        for id in buses {
            manager.add_bus(BusId(*id)).await.unwrap();
        }
        (sim, manager)
    }

    fn lifecycle(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<LifecycleEvent> {
        drain(rx)
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::Lifecycle(e) => Some(e),
                EngineEvent::Value(_) => None,
            })
            .collect()
    }

    fn values(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<ValueEvent> {
        drain(rx)
            .into_iter()
            .filter_map(|e| match e {
                EngineEvent::Value(e) => Some(e),
                EngineEvent::Lifecycle(_) => None,
            })
            .collect()
    }

    fn drain(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_init_discovers_and_starts_polling() {
        let (sim, manager) = engine(&[25, 26]).await;
        sim.attach(BusId(25), sensor(1), 20.0);
        sim.attach(BusId(26), sensor(2), 22.0);
        let mut rx = manager.events();

        manager.init().await.unwrap();

        let events = lifecycle(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| matches!(e, LifecycleEvent::Added { .. })));
        assert_eq!(manager.device_count().await.unwrap(), 2);
        assert_eq!(sim.conversions(&sensor(1)), 1);
        assert!(manager.is_polling());
        manager.shutdown();
        assert!(!manager.is_polling());
    }

    #[tokio::test]
    async fn test_named_before_discovery_is_restored_once() {
        let (sim, manager) = engine(&[25]).await;
        manager.assign_name("T1", sensor(1)).await.unwrap();
        let record = manager.get_device("T1").await.unwrap().unwrap();
        assert!(!record.live);
        assert_eq!(record.bus, None);

        sim.attach(BusId(25), sensor(1), 20.0);
        let mut rx = manager.events();
        manager.init().await.unwrap();

        let events = lifecycle(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            LifecycleEvent::Restored { name, bus: BusId(25), .. } if name == "T1"
        ));
        let record = manager.get_device("T1").await.unwrap().unwrap();
        assert_eq!(record.address, sensor(1));
        assert_eq!(record.bus, Some(BusId(25)));
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_address_triggers_reconciliation() {
        let (sim, manager) = engine(&[25]).await;
        manager.init().await.unwrap();
        sim.attach(BusId(25), sensor(1), 20.0);
        let before = sim.enumerations(BusId(25));

        let mut rx = manager.events();
        manager.assign_name("boiler", sensor(1)).await.unwrap();
        assert_eq!(sim.enumerations(BusId(25)), before + 1);

        let events = lifecycle(&mut rx);
        assert!(matches!(&events[..], [LifecycleEvent::Restored { name, .. }] if name == "boiler"));
        assert!(manager.get_device("boiler").await.unwrap().unwrap().live);
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_rename_live_device() {
        let (sim, manager) = engine(&[25]).await;
        sim.attach(BusId(25), sensor(1), 20.0);
        manager.assign_name("T1", sensor(1)).await.unwrap();
        manager.init().await.unwrap();

        let mut rx = manager.events();
        manager.assign_name("T2", sensor(1)).await.unwrap();

        let events = lifecycle(&mut rx);
        assert_eq!(
            events,
            [LifecycleEvent::Renamed {
                old_name: "T1".to_string(),
                new_name: "T2".to_string(),
                address: sensor(1),
                bus: Some(BusId(25)),
            }]
        );
        assert!(manager.get_device("T1").await.unwrap().is_none());
        let record = manager.get_device("T2").await.unwrap().unwrap();
        assert!(!record.live);
        assert_eq!(manager.device_count().await.unwrap(), 1);

        // the next cycle confirms it again
        manager.poll_once().await.unwrap();
        assert!(manager.get_device("T2").await.unwrap().unwrap().live);
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_assign_name_conflicts() {
        let (_sim, manager) = engine(&[25]).await;
        manager.assign_name("T1", sensor(1)).await.unwrap();
        manager.assign_name("T2", sensor(2)).await.unwrap();

        let mut rx = manager.events();
        manager.assign_name("T1", sensor(1)).await.unwrap();
        assert!(drain(&mut rx).is_empty());

        assert!(matches!(
            manager.assign_name("T1", sensor(2)).await,
            Err(EngineError::NameInUse(name)) if name == "T1"
        ));
        assert!(matches!(
            manager.assign_name("T1", sensor(3)).await,
            Err(EngineError::NameInUse(_))
        ));
        assert!(matches!(
            manager.assign_name("  ", sensor(3)).await,
            Err(EngineError::EmptyName)
        ));
        assert_eq!(manager.device_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_poll_reports_values_and_presence() {
        let (sim, manager) = engine(&[25]).await;
        sim.attach(BusId(25), sensor(1), 20.04);
        manager.init().await.unwrap();
        let mut rx = manager.events();

        manager.poll_once().await.unwrap();
        let readings = values(&mut rx);
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].value, 20.0);

        sim.set_celsius(&sensor(1), 19.96);
        manager.poll_once().await.unwrap();
        assert!(drain(&mut rx).is_empty());

        sim.detach(&sensor(1));
        manager.poll_once().await.unwrap();
        assert!(matches!(&lifecycle(&mut rx)[..], [LifecycleEvent::Lost { .. }]));
        manager.poll_once().await.unwrap();
        assert!(drain(&mut rx).is_empty());

        sim.attach(BusId(25), sensor(1), 20.0);
        manager.poll_once().await.unwrap();
        assert!(matches!(
            &lifecycle(&mut rx)[..],
            [LifecycleEvent::Restored { .. }]
        ));
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_search_reports_checksum_errors() {
        let (sim, manager) = engine(&[25]).await;
        sim.attach(BusId(25), sensor(1), 20.0);
        manager.init().await.unwrap();
        let mut rx = manager.events();

        sim.corrupt_next_enumeration(sensor(1));
        let devices = manager.search_devices().await.unwrap();
        assert_eq!(devices.len(), 1);

        let events = lifecycle(&mut rx);
        assert!(matches!(
            &events[0],
            LifecycleEvent::Error {
                reason: ErrorReason::ChecksumMismatch,
                ..
            }
        ));
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let (sim, manager) = engine(&[25]).await;
        sim.attach(BusId(25), sensor(1), 20.0);

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        manager
            .subscribe_lifecycle(move |e: &LifecycleEvent| {
                sink.lock().unwrap().push(e.kind());
            })
            .unwrap();
        let readings = Arc::new(StdMutex::new(Vec::new()));
        let sink = readings.clone();
        let values_id = manager
            .subscribe_values(move |e: &ValueEvent| sink.lock().unwrap().push(e.value))
            .unwrap();

        manager.init().await.unwrap();
        manager.poll_once().await.unwrap();
        assert!(manager.unsubscribe(values_id));
        sim.set_celsius(&sensor(1), 30.0);
        manager.poll_once().await.unwrap();
        manager.shutdown();

        assert_eq!(*seen.lock().unwrap(), ["added"]);
        assert_eq!(*readings.lock().unwrap(), [20.0]);
    }

    #[tokio::test]
    async fn test_bus_management() {
        let (sim, manager) = engine(&[25]).await;
        assert!(matches!(
            manager.add_bus(BusId(25)).await,
            Err(EngineError::DuplicateBus(BusId(25)))
        ));
        assert!(matches!(
            manager.remove_bus(BusId(7)).await,
            Err(EngineError::UnknownBus(BusId(7)))
        ));

        manager.init().await.unwrap();
        manager.add_bus(BusId(26)).await.unwrap();
        assert!(sim.is_begun(BusId(26)));

        manager.remove_bus(BusId(25)).await.unwrap();
        let ids: Vec<_> = manager
            .buses()
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.id)
            .collect();
        assert_eq!(ids, [BusId(26)]);
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_poll_interval() {
        let (_sim, manager) = engine(&[]).await;
        assert_eq!(manager.poll_interval(), Duration::from_secs(15));

        manager.init().await.unwrap();
        manager.set_poll_interval(Duration::from_secs(5));
        assert_eq!(manager.poll_interval(), Duration::from_secs(5));

        manager.set_poll_interval(Duration::ZERO);
        assert_eq!(manager.poll_interval(), Duration::from_millis(1));

        manager.set_poll_interval(Duration::MAX);
        assert_eq!(manager.poll_interval(), Duration::from_millis(u64::MAX));
        assert!(manager.is_polling());
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_independent_engines() {
        let (sim_a, a) = engine(&[1]).await;
        let (_sim_b, b) = engine(&[1]).await;
        sim_a.attach(BusId(1), sensor(1), 20.0);
        a.init().await.unwrap();
        b.init().await.unwrap();
        assert_eq!(a.device_count().await.unwrap(), 1);
        assert_eq!(b.device_count().await.unwrap(), 0);
        a.shutdown();
        b.shutdown();
    }

    /// Bus that pauses inside one probe until released
    struct PausingBus {
        sim: Arc<SimulatedBus>,
        pause: StdMutex<Option<(oneshot::Sender<()>, mpsc::Receiver<()>)>>,
    }

    impl BusDriver for PausingBus {
        fn reset_and_enumerate(
            &self,
            bus: BusId,
        ) -> std::result::Result<Vec<Address>, DriverError> {
            self.sim.reset_and_enumerate(bus)
        }

        fn probe(&self, bus: BusId, address: &Address) -> std::result::Result<bool, DriverError> {
            let present = self.sim.probe(bus, address);
            if let Some((paused, resume)) = self.pause.lock().unwrap().take() {
                let _ = paused.send(());
                let _ = resume.recv();
            }
            present
        }
    }

    #[tokio::test]
    async fn test_overlapping_operations_deliver_in_state_order() {
        let sim = Arc::new(SimulatedBus::new());
        sim.attach(BusId(25), sensor(1), 20.0);
        let (paused_tx, paused_rx) = oneshot::channel();
        let (resume_tx, resume_rx) = mpsc::channel();
        let bus = Arc::new(PausingBus {
            sim: sim.clone(),
            pause: StdMutex::new(None),
        });
        let manager = SensorManager::new(bus.clone(), sim.clone(), EngineConfig::default());
        manager.add_bus(BusId(25)).await.unwrap();
        manager.init().await.unwrap();
        let mut rx = manager.events();

        // the poll sees the device gone, then holds the lock
        sim.detach(&sensor(1));
        *bus.pause.lock().unwrap() = Some((paused_tx, resume_rx));
        let poller = manager.clone();
        let polling = tokio::spawn(async move { poller.poll_once().await });
        paused_rx.await.unwrap();

        // the scan queues behind it and finds the device back
        sim.attach(BusId(25), sensor(1), 20.0);
        let scanner = manager.clone();
        let scanning = tokio::spawn(async move { scanner.search_devices().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        resume_tx.send(()).unwrap();
        polling.await.unwrap().unwrap();
        scanning.await.unwrap().unwrap();

        let kinds: Vec<_> = lifecycle(&mut rx).iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, ["lost", "restored"]);
        manager.shutdown();
    }

    #[tokio::test]
    async fn test_read_failure_emits_error() {
        let (sim, manager) = engine(&[25]).await;
        sim.attach(BusId(25), sensor(1), 20.0);
        manager.init().await.unwrap();
        manager.poll_once().await.unwrap();

        let mut rx = manager.events();
        sim.set_failing_reads(sensor(1), true);
        manager.poll_once().await.unwrap();
        let events = lifecycle(&mut rx);
        assert!(matches!(
            &events[..],
            [LifecycleEvent::Error {
                reason: ErrorReason::ReadFailed(_),
                ..
            }]
        ));
        let name = events[0].name().to_string();
        assert_eq!(
            manager.get_device(&name).await.unwrap().unwrap().value,
            Some(20.0)
        );
        manager.shutdown();
    }
}
