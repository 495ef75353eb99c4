//! Non-overlapping periodic execution.
//!
//! [`RunningFlag`] guarantees at most one in-flight run of a task; a tick that
//! finds the flag set is skipped, never queued. [`PeriodicLoop`] drives a tick
//! closure on a fixed interval and drains in-flight ticks on shutdown.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

/// Run state of a guarded task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
}

/// Result of a single tick of a periodic task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome<T> {
    /// A previous run was still in flight.
    Skipped,
    Completed(T),
}

impl<T> TickOutcome<T> {
    pub fn is_skipped(&self) -> bool {
        matches!(self, TickOutcome::Skipped)
    }

    pub fn completed(self) -> Option<T> {
        match self {
            TickOutcome::Completed(value) => Some(value),
            TickOutcome::Skipped => None,
        }
    }
}

/// Busy flag for a periodic task.
#[derive(Debug, Default)]
pub struct RunningFlag {
    running: AtomicBool,
}

impl RunningFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the flag. Returns `None` if a run is already in flight.
    ///
    /// The flag is released when the returned guard drops, including when the
    /// run panics or its future is cancelled.
    pub fn try_begin(&self) -> Option<RunGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard { flag: self })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn state(&self) -> RunState {
        if self.is_running() {
            RunState::Running
        } else {
            RunState::Idle
        }
    }
}

/// Releases its [`RunningFlag`] on drop.
#[derive(Debug)]
pub struct RunGuard<'a> {
    flag: &'a RunningFlag,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.running.store(false, Ordering::Release);
    }
}

/// A background loop invoking a tick closure every `period`.
///
/// Each tick runs as its own task so a slow run never delays the timer.
/// Overlap is prevented by the tick body via a [`RunningFlag`].
pub struct PeriodicLoop {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicLoop {
    /// Spawn the loop. With `run_immediately` the first tick fires at once,
    /// otherwise after one full period.
    pub fn spawn<F, Fut>(
        name: &'static str,
        period: Duration,
        run_immediately: bool,
        mut tick: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            if !run_immediately {
                // First tick of a tokio interval completes immediately.
                ticker.tick().await;
            }

            let mut in_flight = JoinSet::new();
            info!(task = name, period_ms = period.as_millis() as u64, "Periodic loop started");

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        while let Some(result) = in_flight.try_join_next() {
                            log_tick_result(name, result);
                        }
                        in_flight.spawn(tick());
                    }
                }
            }

            debug!(task = name, in_flight = in_flight.len(), "Draining in-flight ticks");
            while let Some(result) = in_flight.join_next().await {
                log_tick_result(name, result);
            }
            info!(task = name, "Periodic loop stopped");
        });

        Self {
            name,
            shutdown,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the loop task is still alive.
    pub fn is_active(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Stop scheduling new ticks and wait for any in-flight tick to finish.
    /// Calling `stop` again is a no-op.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(task = self.name, error = %e, "Periodic loop terminated abnormally");
            }
        }
    }
}

impl Drop for PeriodicLoop {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

fn log_tick_result(name: &'static str, result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!(task = name, "Periodic tick panicked");
        }
    }
}
