//! Test-facing lifecycle controller.
//!
//! A [`StepController`] owns the harness side of one embedded server:
//! it registers the intercepting wait provider, arms interception,
//! waits for the boot proof, and then single-steps the server:
//! [`StepController::run_update`] releases exactly one update cycle,
//! [`StepController::run_sigusr1`] exactly one interrupt cycle, and
//! each returns only after its cycle has fully executed.
//!
//! ```text
//! Unarmed ──initialise──► AwaitingBoot ──first tick-wait──► Running
//!    Running ──shutdown──► ShuttingDown ──► Terminated
//! ```
//!
//! Releasing a gate no worker ever visits blocks forever by gate
//! contract; the controller cannot detect that, only the external
//! test-runner timeout can.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use thiserror::Error;
use tracing::{debug, info};

use crate::context::{HarnessContext, INTERRUPT_SIGNAL};
use crate::intercept::WaitProvider;
use crate::runtime::ControlRuntime;

/// How long `shutdown` waits for the runtime's own shutdown path to
/// take effect after cancellation was delivered.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

/// Controller misuse, surfaced instead of recovered.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HarnessError {
    /// A step operation was issued before `initialise()` completed,
    /// so no worker could possibly be waiting.
    #[error("{operation}() called before initialise() completed")]
    NotInitialised { operation: &'static str },

    /// `initialise()` may run once per context.
    #[error("initialise() called twice on the same harness context")]
    AlreadyInitialised,

    /// A boot-time interrupt signal could not be delivered.
    #[error("boot-time signal release failed: {errno}")]
    SignalRelease { errno: Errno },
}

/// Options for [`StepController::initialise`].
#[derive(Debug, Clone, Copy)]
pub struct InitOptions {
    /// Stop the framework's pass-through signal waits from consuming
    /// signals, so the test's own handlers receive them instead.
    pub suppress_framework_signals: bool,
    /// Number of real interrupt signals sent to the process after the
    /// boot proof. A runtime whose signal worker entered its wait
    /// before interception was armed is parked in the *real* signal
    /// wait; each release displaces it through one throwaway interrupt
    /// cycle so it re-enters the now-armed wait and becomes steppable.
    /// Most configurations need none; observed runtimes have needed
    /// one or two. Only configure releases when such a worker (or a
    /// handler) is there to consume the signal; with neither, the
    /// default signal disposition terminates the process.
    pub signal_boot_releases: u32,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            suppress_framework_signals: false,
            signal_boot_releases: 0,
        }
    }
}

/// Drives one embedded server deterministically from a single test
/// thread.
pub struct StepController {
    ctx: Arc<HarnessContext>,
    runtime: Arc<dyn ControlRuntime>,
}

impl StepController {
    /// Create the controller and register the intercepting wait
    /// provider with the runtime.
    ///
    /// Must run before the runtime's worker threads start, otherwise
    /// they block on the real OS primitives and never become
    /// controllable.
    pub fn new(ctx: Arc<HarnessContext>, runtime: Arc<dyn ControlRuntime>) -> Self {
        runtime.install_wait_provider(Arc::clone(&ctx) as Arc<dyn WaitProvider>);
        debug!("wait provider registered with the runtime");
        Self { ctx, runtime }
    }

    /// Shared harness context.
    #[must_use]
    pub fn context(&self) -> &Arc<HarnessContext> {
        &self.ctx
    }

    /// Arm interception and block until the server proves it reached
    /// its controllable main-loop wait.
    ///
    /// Returns once the first recognized tick-wait has been observed
    /// and any configured boot-time interrupt signals have been sent.
    /// The displaced signal worker finishes its throwaway cycle
    /// asynchronously; the next `run_sigusr1` synchronizes with it
    /// through the gate as usual.
    pub fn initialise(&self, options: InitOptions) -> Result<(), HarnessError> {
        if self.ctx.is_armed() {
            return Err(HarnessError::AlreadyInitialised);
        }
        self.ctx
            .set_suppress_framework_signals(options.suppress_framework_signals);
        self.ctx.arm();
        self.ctx.wait_until_booted();
        for release in 0..options.signal_boot_releases {
            debug!(release = release + 1, "boot-time interrupt signal sent");
            kill(Pid::this(), INTERRUPT_SIGNAL)
                .map_err(|errno| HarnessError::SignalRelease { errno })?;
        }
        info!(phase = %self.ctx.phase(), "initialise complete");
        Ok(())
    }

    /// Release exactly one update cycle and wait for it to complete.
    pub fn run_update(&self) -> Result<(), HarnessError> {
        self.ensure_ready("run_update")?;
        self.ctx.update_gate().grant_and_wait_consumed();
        Ok(())
    }

    /// Release exactly one interrupt cycle and wait for it to
    /// complete.
    pub fn run_sigusr1(&self) -> Result<(), HarnessError> {
        self.ensure_ready("run_sigusr1")?;
        self.ctx.signal_gate().grant_and_wait_consumed();
        Ok(())
    }

    fn ensure_ready(&self, operation: &'static str) -> Result<(), HarnessError> {
        if self.ctx.is_booted() {
            Ok(())
        } else {
            Err(HarnessError::NotInitialised { operation })
        }
    }

    /// Shut the embedded server down and unwind the gates.
    ///
    /// Delivers cancellation to the runtime, force-releases both gates
    /// so no worker stays parked, then waits briefly for the runtime's
    /// shutdown path to take effect. Idempotent; safe to call from
    /// drop glue.
    pub fn shutdown(&self) {
        if self.ctx.is_shutting_down() {
            return;
        }
        info!("shutdown requested");
        self.ctx.begin_shutdown();
        self.runtime.request_exit();
        self.ctx.update_gate().force_release();
        self.ctx.signal_gate().force_release();
        thread::sleep(SHUTDOWN_GRACE);
        self.ctx.mark_terminated();
        info!(phase = %self.ctx.phase(), "shutdown complete");
    }
}
