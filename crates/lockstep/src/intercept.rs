//! Interception of the framework's two blocking waits.
//!
//! The embedded framework obtains its "sleep until the next tick" and
//! "wait for a signal" primitives through the [`WaitProvider`] seam.
//! In production that is [`OsWaits`], which blocks for real. Under the
//! harness it is the [`HarnessContext`] itself: invocations matching
//! the reserved signature (the [`TICK_SENTINEL`] period, or a signal
//! set containing [`INTERRUPT_SIGNAL`]) are rerouted through the
//! corresponding gate, and everything else passes through to the OS
//! unchanged. Arbitrary library code may share these primitives, so
//! the pass-through paths must stay observably equivalent to the real
//! thing.

use std::thread;
use std::time::Duration;

use nix::sys::signal::{SigSet, Signal};
use tracing::{debug, trace};

use crate::context::{HarnessContext, INTERRUPT_SIGNAL, TICK_SENTINEL};

/// The two blocking waits the framework's main loop depends on.
///
/// `tick_wait` suspends the calling worker until the next update round
/// is due; `signal_wait` suspends it until one of the requested
/// signals arrives and reports which one.
pub trait WaitProvider: Send + Sync {
    /// Block for the requested tick period.
    fn tick_wait(&self, requested: Duration);

    /// Block until a signal in `set` is delivered; report it.
    fn signal_wait(&self, set: &SigSet) -> nix::Result<Signal>;
}

/// Real OS waits: a plain sleep and a plain sigwait.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsWaits;

impl WaitProvider for OsWaits {
    fn tick_wait(&self, requested: Duration) {
        thread::sleep(requested);
    }

    fn signal_wait(&self, set: &SigSet) -> nix::Result<Signal> {
        set.wait()
    }
}

impl WaitProvider for HarnessContext {
    /// Tick-wait shim.
    ///
    /// Unarmed or off-sentinel invocations sleep for real. A
    /// recognized invocation records the boot proof (first time only)
    /// and parks on the update gate; on release it returns as if the
    /// sleep had completed, and the framework runs exactly one update
    /// cycle before coming back.
    fn tick_wait(&self, requested: Duration) {
        if !self.is_armed() || requested != TICK_SENTINEL {
            trace!(?requested, "tick-wait passed through");
            OsWaits.tick_wait(requested);
            return;
        }
        self.mark_booted();
        self.update_gate().await_permit();
    }

    /// Signal-wait shim.
    ///
    /// A set without the reserved signal is waited on for real. If the
    /// test enabled signal suppression in the meantime, the calling
    /// framework thread is then parked on an empty set so it never
    /// consumes another signal; the test's own handlers get them.
    /// A recognized invocation parks on the signal gate and reports
    /// the reserved signal as received.
    fn signal_wait(&self, set: &SigSet) -> nix::Result<Signal> {
        if !self.is_armed() || !set.contains(INTERRUPT_SIGNAL) {
            let sig = OsWaits.signal_wait(set)?;
            if self.suppresses_framework_signals() {
                debug!(signal = %sig, "signal delivery suppressed, parking framework waiter");
                loop {
                    SigSet::empty().wait()?;
                }
            }
            return Ok(sig);
        }
        self.signal_gate().await_permit();
        Ok(INTERRUPT_SIGNAL)
    }
}
