//! Interface to the opaque server runtime.
//!
//! The harness never looks inside the equipment-access framework; it
//! only needs two things from it: a registration point for the wait
//! provider (before any worker thread starts) and an
//! external-cancellation hook. Everything else (the location
//! registry, property dispatch, the worker threads that loop over
//! tick-wait/update and signal-wait/interrupt) belongs to the
//! runtime.

use std::sync::Arc;

use crate::intercept::WaitProvider;
use crate::property::PropertyAccess;
use crate::server::InstanceInfo;

/// The runtime surface the lifecycle controller drives.
pub trait ControlRuntime: Send + Sync {
    /// Install the waits the runtime's main loop will block on.
    ///
    /// Must be called before the runtime's worker threads start; the
    /// harness installs the intercepting provider here, production
    /// wiring installs [`crate::intercept::OsWaits`].
    fn install_wait_provider(&self, waits: Arc<dyn WaitProvider>);

    /// Deliver external cancellation.
    ///
    /// The runtime's own shutdown path runs in response. A production
    /// adapter raises the process termination signal here so the
    /// embedded server's internal handler unwinds it; simulated
    /// runtimes set an exit flag their workers observe after each
    /// wait.
    fn request_exit(&self);
}

/// A runtime that can be hosted by [`crate::server::ThreadedServer`].
pub trait EmbeddedServer: ControlRuntime + PropertyAccess {
    /// Run the server's main loop for the given instance.
    ///
    /// Blocks until [`ControlRuntime::request_exit`] has been
    /// delivered and the worker threads have wound down.
    fn run(&self, instance: &InstanceInfo);
}
