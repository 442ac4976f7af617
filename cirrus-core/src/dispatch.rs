//! System → application context hand-off.
//!
//! Two logical execution contexts exist: the *system* context owns the wire
//! transport and fires completion/request callbacks; the *application*
//! context is where all user-visible callbacks run. Crossing between them is
//! an explicit, asynchronous hand-off: the system side enqueues a unit of
//! work and returns immediately; the unit runs later, at most once, on the
//! application context.
//!
//! Concurrency model:
//! - flume channel for runtime-agnostic queueing
//! - FIFO per submission site, no ordering guarantee across sites
//! - no lock is held across the hand-off

use flume::{Receiver, Sender};

use crate::error::{Error, Result};

/// A unit of work scheduled onto the application context.
pub type AppTask = Box<dyn FnOnce() + Send + 'static>;

/// Cloneable handle used by the system context to schedule work.
#[derive(Debug, Clone)]
pub struct AppHandle {
    tx: Sender<AppTask>,
}

impl AppHandle {
    /// Enqueue `task` to run on the application context.
    ///
    /// Returns immediately; `Ok(())` means the task was accepted and will
    /// run at most once.
    pub fn invoke(&self, task: impl FnOnce() + Send + 'static) -> Result<()> {
        self.tx
            .send(Box::new(task))
            .map_err(|_| Error::transport("application context is gone"))
    }
}

/// The application-context executor.
///
/// The owner pumps it from the thread that plays the application role,
/// either one batch at a time (`run_pending`) or as a blocking loop (`run`).
pub struct AppContext {
    rx: Receiver<AppTask>,
    handle: AppHandle,
}

impl Default for AppContext {
    fn default() -> Self {
        Self::new()
    }
}

impl AppContext {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            rx,
            handle: AppHandle { tx },
        }
    }

    /// Handle for submitting work from other contexts.
    #[must_use]
    pub fn handle(&self) -> AppHandle {
        self.handle.clone()
    }

    /// Run every task that is queued right now; returns the count executed.
    pub fn run_pending(&self) -> usize {
        let mut n = 0;
        while let Ok(task) = self.rx.try_recv() {
            task();
            n += 1;
        }
        n
    }

    /// Blocking event loop; returns when every handle has been dropped.
    ///
    /// Consumes the context so its internal handle cannot keep the loop
    /// alive on its own.
    pub fn run(self) {
        let Self { rx, handle } = self;
        drop(handle);
        while let Ok(task) = rx.recv() {
            task();
        }
    }
}
