//! Event fan-out to subscribers
//!
//! Every subscriber owns a worker thread fed by an unbounded channel, so
//! dispatching never waits on a slow handler. Handlers run one event at a
//! time in emission order. A panicking handler is logged and its worker
//! keeps going.
//!
//! Async consumers can use [`Notifier::events`] instead, a broadcast stream
//! carrying both lifecycle and value events.
//!
//! Shutdown waits a bounded time for queues to drain. A handler that never
//! returns keeps its own thread but is detached rather than waited on.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thermowire_core::{EngineEvent, EventBatch, LifecycleEvent, ValueEvent};
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::error::Result;

/// Capacity of the broadcast stream before slow receivers start lagging
const STREAM_CAPACITY: usize = 256;

/// How long [`Notifier::shutdown`] waits for subscriber queues to drain
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

const DRAIN_POLL: Duration = Duration::from_millis(5);

/// Handle returned by a subscription, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Receives device lifecycle changes
pub trait LifecycleSubscriber: Send + 'static {
    fn on_lifecycle_event(&mut self, event: &LifecycleEvent);
}

/// Receives reading changes
pub trait ValueSubscriber: Send + 'static {
    fn on_value_event(&mut self, event: &ValueEvent);
}

impl<F> LifecycleSubscriber for F
where
    F: FnMut(&LifecycleEvent) + Send + 'static,
{
    fn on_lifecycle_event(&mut self, event: &LifecycleEvent) {
        self(event)
    }
}

impl<F> ValueSubscriber for F
where
    F: FnMut(&ValueEvent) + Send + 'static,
{
    fn on_value_event(&mut self, event: &ValueEvent) {
        self(event)
    }
}

struct Subscriber<E> {
    id: SubscriptionId,
    sender: mpsc::Sender<E>,
    worker: JoinHandle<()>,
}

pub struct Notifier {
    next_id: AtomicU64,
    lifecycle: Mutex<Vec<Subscriber<LifecycleEvent>>>,
    values: Mutex<Vec<Subscriber<ValueEvent>>>,
    /// Workers of removed subscribers, still draining their queues
    retired: Mutex<Vec<JoinHandle<()>>>,
    stream: broadcast::Sender<EngineEvent>,
}

impl Notifier {
    pub fn new() -> Self {
        let (stream, _) = broadcast::channel(STREAM_CAPACITY);
        Self {
            next_id: AtomicU64::new(1),
            lifecycle: Mutex::new(Vec::new()),
            values: Mutex::new(Vec::new()),
            retired: Mutex::new(Vec::new()),
            stream,
        }
    }

    pub fn subscribe_lifecycle(
        &self,
        mut subscriber: impl LifecycleSubscriber,
    ) -> Result<SubscriptionId> {
        let id = self.next_id();
        let (sender, worker) = spawn_worker(format!("tw-lifecycle-{}", id.0), move |event| {
            subscriber.on_lifecycle_event(event)
        })?;
        self.lifecycle.lock().push(Subscriber { id, sender, worker });
        debug!(subscription = %id, "Lifecycle subscriber added");
        Ok(id)
    }

    pub fn subscribe_values(&self, mut subscriber: impl ValueSubscriber) -> Result<SubscriptionId> {
        let id = self.next_id();
        let (sender, worker) = spawn_worker(format!("tw-value-{}", id.0), move |event| {
            subscriber.on_value_event(event)
        })?;
        self.values.lock().push(Subscriber { id, sender, worker });
        debug!(subscription = %id, "Value subscriber added");
        Ok(id)
    }

    /// Remove a subscriber from whichever list holds it.
    ///
    /// Events already queued are still delivered. Returns false if the id is
    /// unknown or was already removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let worker = remove(&self.lifecycle, id).or_else(|| remove(&self.values, id));
        match worker {
            Some(worker) => {
                let mut retired = self.retired.lock();
                retired.retain(|w| !w.is_finished());
                retired.push(worker);
                debug!(subscription = %id, "Subscriber removed");
                true
            }
            None => false,
        }
    }

    /// A new receiver on the combined event stream
    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.stream.subscribe()
    }

    /// Queue every event in the batch for every subscriber
    pub fn dispatch(&self, batch: EventBatch) {
        if batch.is_empty() {
            return;
        }
        fan_out(&self.lifecycle, &batch.lifecycle);
        fan_out(&self.values, &batch.values);

        for event in batch.lifecycle {
            let _ = self.stream.send(event.into());
        }
        for event in batch.values {
            let _ = self.stream.send(event.into());
        }
    }

    /// Drop every subscriber and wait up to [`SHUTDOWN_GRACE`] for their
    /// queues to drain
    pub fn shutdown(&self) {
        self.shutdown_within(SHUTDOWN_GRACE);
    }

    /// Close every queue and wait up to `grace` for the workers to finish.
    ///
    /// Workers still busy when the grace period ends are detached. Returns
    /// true if every worker finished in time.
    pub fn shutdown_within(&self, grace: Duration) -> bool {
        let current = thread::current().id();
        let mut workers = self.close_all();
        // A handler shutting the engine down cannot wait for itself
        workers.retain(|w| w.thread().id() != current);

        let deadline = Instant::now() + grace;
        loop {
            workers.retain(|w| !w.is_finished());
            if workers.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                warn!(busy = workers.len(), "Detaching subscribers still busy at shutdown");
                return false;
            }
            thread::sleep(DRAIN_POLL);
        }
    }

    /// Remove every subscriber, closing its queue. Returns all workers.
    fn close_all(&self) -> Vec<JoinHandle<()>> {
        let lifecycle: Vec<_> = self.lifecycle.lock().drain(..).collect();
        let values: Vec<_> = self.values.lock().drain(..).collect();
        let retired: Vec<_> = self.retired.lock().drain(..).collect();
        lifecycle
            .into_iter()
            .map(|s| s.worker)
            .chain(values.into_iter().map(|s| s.worker))
            .chain(retired)
            .collect()
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        // Closing the queues lets workers exit once drained; nothing waits
        self.close_all();
    }
}

fn spawn_worker<E, F>(name: String, mut handler: F) -> Result<(mpsc::Sender<E>, JoinHandle<()>)>
where
    E: Send + 'static,
    F: FnMut(&E) + Send + 'static,
{
    let (sender, receiver) = mpsc::channel::<E>();
    let worker = thread::Builder::new().name(name).spawn(move || {
        while let Ok(event) = receiver.recv() {
            if panic::catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                error!(worker = ?thread::current().name(), "Subscriber panicked while handling event");
            }
        }
    })?;
    Ok((sender, worker))
}

/// Take a subscriber out of `list`, closing its queue. Returns its worker.
fn remove<E>(list: &Mutex<Vec<Subscriber<E>>>, id: SubscriptionId) -> Option<JoinHandle<()>> {
    let mut list = list.lock();
    let index = list.iter().position(|s| s.id == id)?;
    Some(list.remove(index).worker)
}

fn fan_out<E: Clone>(list: &Mutex<Vec<Subscriber<E>>>, events: &[E]) {
    if events.is_empty() {
        return;
    }
    for subscriber in list.lock().iter() {
        for event in events {
            if subscriber.sender.send(event.clone()).is_err() {
                debug!(subscription = %subscriber.id, "Subscriber worker has exited");
                break;
            }
        }
    }
}
