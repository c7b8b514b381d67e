//! Fixed-period background task
//!
//! The callback is awaited before the next tick is taken, so it never runs
//! concurrently with itself. A tick that overruns the period delays the
//! following ones instead of bursting to catch up.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::debug;

use crate::config::MIN_POLL_INTERVAL_MS;

/// Longest period the timer accepts; longer ones would overflow `Instant`
const MAX_PERIOD: Duration = Duration::from_secs(365 * 24 * 60 * 60);

pub struct PeriodicTask {
    period: watch::Sender<Duration>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Start calling `tick` every `period`, first after one full period
    pub fn spawn<F, Fut>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (period_tx, mut period_rx) = watch::channel(clamp(period));
        let handle = tokio::spawn(async move {
            let mut ticker = new_ticker(*period_rx.borrow_and_update());
            loop {
                tokio::select! {
                    _ = ticker.tick() => tick().await,
                    changed = period_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let period = *period_rx.borrow_and_update();
                        let period_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX);
                        debug!(period_ms, "Poll period changed");
                        ticker = new_ticker(period);
                    }
                }
            }
        });
        Self {
            period: period_tx,
            handle,
        }
    }

    /// Change the period. The next tick is one new period from now.
    pub fn set_period(&self, period: Duration) {
        self.period.send_replace(clamp(period));
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn clamp(period: Duration) -> Duration {
    period.clamp(Duration::from_millis(MIN_POLL_INTERVAL_MS), MAX_PERIOD)
}

fn new_ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}
