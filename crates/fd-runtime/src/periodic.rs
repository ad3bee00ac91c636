//! Named background thread running a task at a fixed period.
//!
//! Used for the polled FIFO drain and for temperature compensation. The
//! thread sleeps on a condition variable so `stop()` wakes it immediately
//! instead of waiting out the period.

use fd_common::{FdError, FdResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct StopSignal {
    stop: Mutex<bool>,
    wake: Condvar,
}

impl StopSignal {
    /// Sleep until `deadline` or a stop request. Returns true if stopped.
    fn wait_until(&self, deadline: Instant) -> bool {
        let mut stop = self.stop.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if *stop {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            stop = self
                .wake
                .wait_timeout(stop, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn set(&self, value: bool) {
        *self.stop.lock().unwrap_or_else(PoisonError::into_inner) = value;
        self.wake.notify_all();
    }
}

/// A task invoked every `period` on its own thread.
#[derive(Debug)]
pub struct PeriodicWorker {
    name: String,
    period: Duration,
    signal: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl PeriodicWorker {
    /// Create a stopped worker. `name` becomes the thread name.
    pub fn new(name: impl Into<String>, period: Duration) -> Self {
        Self {
            name: name.into(),
            period,
            signal: Arc::new(StopSignal::default()),
            handle: None,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn the thread. `tick` first runs one period after start.
    ///
    /// # Errors
    ///
    /// Returns [`FdError::Config`] if already running, the period is zero or
    /// the thread cannot be spawned.
    pub fn start<F>(&mut self, mut tick: F) -> FdResult<()>
    where
        F: FnMut() + Send + 'static,
    {
        if self.running.load(Ordering::Acquire) {
            return Err(FdError::Config(format!("{} already running", self.name)));
        }
        if self.period.is_zero() {
            return Err(FdError::Config(format!("{} period must be non-zero", self.name)));
        }

        info!(worker = %self.name, period_ms = self.period.as_millis(), "Starting periodic worker");
        self.signal.set(false);

        let signal = Arc::clone(&self.signal);
        let running = Arc::clone(&self.running);
        let period = self.period;
        let name = self.name.clone();

        // set before spawn so is_running() is true immediately
        self.running.store(true, Ordering::Release);

        let handle = match thread::Builder::new().name(self.name.clone()).spawn(move || {
            debug!(worker = %name, "periodic worker started");
            let mut deadline = Instant::now() + period;
            while !signal.wait_until(deadline) {
                tick();
                deadline += period;
                // skip missed periods instead of bursting
                let now = Instant::now();
                if deadline < now {
                    deadline = now + period;
                }
            }
            running.store(false, Ordering::Release);
            debug!(worker = %name, "periodic worker stopped");
        }) {
            Ok(h) => h,
            Err(e) => {
                self.running.store(false, Ordering::Release);
                return Err(FdError::Config(format!(
                    "failed to spawn {} thread: {e}",
                    self.name
                )));
            }
        };

        self.handle = Some(handle);
        Ok(())
    }

    /// Stop the thread and wait for the current tick to finish. Idempotent.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        info!(worker = %self.name, "Stopping periodic worker");
        self.signal.set(true);
        if let Err(e) = handle.join() {
            warn!(worker = %self.name, "periodic worker panicked: {:?}", e);
        }
        self.running.store(false, Ordering::Release);
    }

    /// Whether the thread is alive.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Configured period.
    pub fn period(&self) -> Duration {
        self.period
    }
}

impl Drop for PeriodicWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
