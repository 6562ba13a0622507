//! Process-scoped harness context.
//!
//! One [`HarnessContext`] holds everything the interception layer and
//! the lifecycle controller share: the two gates and the monotonic
//! lifecycle flags. It is constructed explicitly and passed around by
//! `Arc`. Interception happens at a boundary every framework thread
//! crosses, but keeping the state in one owned object (instead of
//! process statics) makes lifetime and test isolation explicit.
//!
//! Each flag has a single writer and flips `false → true` exactly once:
//! `armed` when the test arms interception, `booted` when the first
//! controllable tick-wait is observed, `shutting_down` / `terminated`
//! on the way out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use nix::sys::signal::Signal;
use tracing::info;

use crate::gate::Gate;

/// The reserved tick period marking the framework's controllable
/// update-loop wait.
///
/// The embedded server must be configured to tick at exactly this
/// period; the tick-wait shim recognizes the value and reroutes the
/// wait through the update gate. Any other requested duration, from
/// the framework or from unrelated library code, is slept for real.
/// The value is deliberately one nanosecond short of a second so that
/// no plausible real-world tick rate collides with it.
pub const TICK_SENTINEL: Duration = Duration::from_nanos(999_999_999);

/// The reserved asynchronous-interrupt signal.
///
/// A signal-wait on a set containing this signal is the framework's
/// controllable interrupt wait; any other set is waited on for real.
pub const INTERRUPT_SIGNAL: Signal = Signal::SIGUSR1;

/// Granularity of the boot-proof poll in `initialise`.
pub(crate) const BOOT_POLL_INTERVAL: Duration = Duration::from_micros(50);

/// Lifecycle phase derived from the monotonic flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    /// Interception not armed; all waits pass through to the OS.
    Unarmed,
    /// Armed, waiting for the server's first controllable tick-wait.
    AwaitingBoot,
    /// Boot proof observed; the server is steppable.
    Running,
    /// Shutdown requested; gates are force-released.
    ShuttingDown,
    /// Shutdown complete.
    Terminated,
}

impl std::fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unarmed => write!(f, "unarmed"),
            Self::AwaitingBoot => write!(f, "awaiting-boot"),
            Self::Running => write!(f, "running"),
            Self::ShuttingDown => write!(f, "shutting-down"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Shared state of one harness instance: both gates plus the
/// lifecycle flags.
#[derive(Debug)]
pub struct HarnessContext {
    update_gate: Gate,
    signal_gate: Gate,
    armed: AtomicBool,
    booted: AtomicBool,
    shutting_down: AtomicBool,
    terminated: AtomicBool,
    suppress_framework_signals: AtomicBool,
}

impl Default for HarnessContext {
    fn default() -> Self {
        Self::new()
    }
}

impl HarnessContext {
    /// Create a fresh context with both gates open and all flags clear.
    #[must_use]
    pub fn new() -> Self {
        Self {
            update_gate: Gate::new("update"),
            signal_gate: Gate::new("signal"),
            armed: AtomicBool::new(false),
            booted: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            suppress_framework_signals: AtomicBool::new(false),
        }
    }

    pub(crate) fn update_gate(&self) -> &Gate {
        &self.update_gate
    }

    pub(crate) fn signal_gate(&self) -> &Gate {
        &self.signal_gate
    }

    /// Arm interception. From here on the shims recognize the sentinel
    /// invocations instead of passing them through.
    pub(crate) fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
        info!("interception armed");
    }

    /// Whether interception is armed.
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Record the boot proof. Returns `true` on the first call only.
    pub(crate) fn mark_booted(&self) -> bool {
        let first = !self.booted.swap(true, Ordering::SeqCst);
        if first {
            info!("boot proof: first controllable tick-wait observed");
        }
        first
    }

    /// Whether the server has reached its controllable main-loop wait.
    #[must_use]
    pub fn is_booted(&self) -> bool {
        self.booted.load(Ordering::SeqCst)
    }

    /// Block until the boot proof has been recorded.
    ///
    /// This is the one poll loop in the harness: it crosses the
    /// registration boundary where no waiter/notifier pairing exists
    /// yet. Sub-millisecond latency at negligible CPU cost.
    pub(crate) fn wait_until_booted(&self) {
        while !self.is_booted() {
            thread::sleep(BOOT_POLL_INTERVAL);
        }
    }

    pub(crate) fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_terminated(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    /// Let the framework's pass-through signal waits swallow no more
    /// signals, so the test's own handlers receive them instead.
    pub fn set_suppress_framework_signals(&self, suppress: bool) {
        self.suppress_framework_signals
            .store(suppress, Ordering::SeqCst);
    }

    /// Whether pass-through signal delivery is suppressed.
    #[must_use]
    pub fn suppresses_framework_signals(&self) -> bool {
        self.suppress_framework_signals.load(Ordering::SeqCst)
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> LifecyclePhase {
        if self.terminated.load(Ordering::SeqCst) {
            LifecyclePhase::Terminated
        } else if self.is_shutting_down() {
            LifecyclePhase::ShuttingDown
        } else if self.is_booted() {
            LifecyclePhase::Running
        } else if self.is_armed() {
            LifecyclePhase::AwaitingBoot
        } else {
            LifecyclePhase::Unarmed
        }
    }
}
