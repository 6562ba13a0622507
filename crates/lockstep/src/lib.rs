//! lockstep: deterministic test harness for equipment-control servers.
//!
//! Production servers built on an equipment-access framework run an
//! event loop driven by timers and signals: a periodic tick runs
//! `update()` across all registered locations, an asynchronous user
//! signal runs the interrupt handler. Tests need to drive both
//! callbacks on demand, one step at a time, from a single test
//! thread: no wall-clock delays, no signal races.
//!
//! lockstep intercepts the two blocking waits the framework's main
//! loop depends on and turns them into rendezvous points:
//!
//! ```text
//! framework worker ──► tick_wait(TICK_SENTINEL) ──► Gate("update")
//! framework worker ──► signal_wait({SIGUSR1})   ──► Gate("signal")
//!                                                      ▲
//! test thread ──► run_update() / run_sigusr1() ────────┘
//! ```
//!
//! Invocations that do not match the reserved signatures pass through
//! to the real OS primitives, so unrelated code sharing them is
//! unaffected.
//!
//! # Modules
//!
//! - `gate`: the single-slot permit/rendezvous primitive
//! - `context`: shared harness context (gates + lifecycle flags)
//! - `intercept`: the `WaitProvider` seam and the two shims
//! - `controller`: test-facing lifecycle operations
//! - `runtime`: traits the opaque server runtime implements
//! - `property`: typed property get/set accessors
//! - `server`: bootstrap for parallel embedded-server instances
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod context;
pub mod controller;
pub mod gate;
pub mod intercept;
pub mod property;
pub mod runtime;
pub mod server;

pub use context::{HarnessContext, INTERRUPT_SIGNAL, LifecyclePhase, TICK_SENTINEL};
pub use controller::{HarnessError, InitOptions, StepController};
pub use gate::Gate;
pub use intercept::{OsWaits, WaitProvider};
pub use property::{
    ACCESS_RETRY_LIMIT, Properties, PropertyAccess, PropertyError, PropertyValue, parse_address,
};
pub use runtime::{ControlRuntime, EmbeddedServer};
pub use server::{InstanceInfo, ServerError, ServerOptions, ThreadedServer};
