//! Single-slot permit/rendezvous gate.
//!
//! A [`Gate`] turns one of the framework's blocking waits into a
//! rendezvous point: a worker thread parks in [`Gate::await_permit`]
//! until the controlling test thread posts a permit with
//! [`Gate::grant_and_wait_consumed`]. The harness instantiates exactly
//! two gates, one for the periodic-update wait and one for the
//! interrupt-signal wait.
//!
//! ```text
//! controller                         worker
//! ----------                         ------
//! grant_and_wait_consumed()
//!   post permit ────────────────────► await_permit() returns
//!   park on `consumed`                run one update/interrupt cycle
//!                                     await_permit() re-entered
//!   observe re-park ◄────────────────   (parked count rises)
//!   return
//! ```
//!
//! Consumption is complete only once the released waiter has finished
//! its downstream cycle and returned to the gate. This is what lets the
//! controller assert "this step has been fully executed" on return,
//! without any lock being held across the framework callback.
//!
//! There are no timeouts. Granting a permit on a gate that no worker
//! ever visits blocks the controller forever; only the external
//! test-runner timeout catches that, and it is a test-author error
//! rather than a harness fault.

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

#[derive(Debug)]
struct GateState {
    /// One permit slot. Never more than one outstanding.
    permit: bool,
    /// Workers currently inside `await_permit`.
    parked: usize,
    /// Terminal flag. Once set, all waits return immediately.
    shutdown: bool,
}

/// Single-slot, single-granter rendezvous gate.
///
/// Any number of worker threads may call [`Gate::await_permit`]
/// (in practice one per gate, re-entering across loop iterations), but
/// only one controller thread at a time may call
/// [`Gate::grant_and_wait_consumed`].
#[derive(Debug)]
pub struct Gate {
    name: &'static str,
    state: Mutex<GateState>,
    /// Workers park here until a permit is posted.
    granted: Condvar,
    /// The granter parks here until the permit has round-tripped.
    consumed: Condvar,
}

impl Gate {
    /// Create a gate. The name only appears in trace output.
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(GateState {
                permit: false,
                parked: 0,
                shutdown: false,
            }),
            granted: Condvar::new(),
            consumed: Condvar::new(),
        }
    }

    /// Gate name given at construction.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Park until a permit is posted, consume it, and return.
    ///
    /// Returns immediately when the gate has already been shut down;
    /// a permit posted by [`Gate::force_release`] is consumed like any
    /// other so late arrivals do not trip over it.
    pub fn await_permit(&self) {
        let mut state = self.state.lock();
        if state.shutdown {
            trace!(gate = self.name, "gate shut down, waiter released at entry");
            return;
        }
        state.parked += 1;
        // A worker arriving at the gate is the event the granter's
        // second wait observes.
        self.consumed.notify_all();
        trace!(gate = self.name, parked = state.parked, "waiter parked");
        while !state.permit && !state.shutdown {
            self.granted.wait(&mut state);
        }
        state.permit = false;
        state.parked -= 1;
        self.consumed.notify_all();
        trace!(gate = self.name, "permit consumed");
    }

    /// Post one permit and block until it has fully round-tripped.
    ///
    /// "Round-tripped" means the permit was consumed by exactly one
    /// waiter *and* a waiter is parked at the gate again, i.e. the
    /// released worker has completed whatever it does between two
    /// visits. Returns early only when the gate is shut down.
    pub fn grant_and_wait_consumed(&self) {
        let mut state = self.state.lock();
        // Single slot: any previous permit must round-trip first.
        while state.permit && !state.shutdown {
            self.consumed.wait(&mut state);
        }
        if state.shutdown {
            debug!(gate = self.name, "grant skipped, gate shut down");
            return;
        }
        state.permit = true;
        self.granted.notify_one();
        debug!(gate = self.name, "permit granted");
        while (state.permit || state.parked == 0) && !state.shutdown {
            self.consumed.wait(&mut state);
        }
        debug!(gate = self.name, "step complete");
    }

    /// Shut the gate down: post a final permit and wake everyone
    /// without waiting for consumption. The waiter may be gone already
    /// or may ignore the stale permit; both are fine.
    pub fn force_release(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        state.permit = true;
        self.granted.notify_all();
        self.consumed.notify_all();
        debug!(gate = self.name, parked = state.parked, "force released");
    }

    /// Whether [`Gate::force_release`] has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shutdown
    }
}

#[cfg(test)]
mod tests {
    use super::Gate;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn grant_returns_only_after_downstream_cycle() {
        let gate = Arc::new(Gate::new("update"));
        let cycles = Arc::new(AtomicUsize::new(0));

        let worker = {
            let gate = Arc::clone(&gate);
            let cycles = Arc::clone(&cycles);
            thread::spawn(move || {
                loop {
                    gate.await_permit();
                    if gate.is_shut_down() {
                        break;
                    }
                    // Downstream cycle between two gate visits.
                    thread::sleep(Duration::from_millis(5));
                    cycles.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        gate.grant_and_wait_consumed();
        assert_eq!(
            cycles.load(Ordering::SeqCst),
            1,
            "grant must not return before the released cycle completed"
        );

        gate.force_release();
        worker.join().unwrap();
    }

    #[test]
    fn sequential_grants_release_one_cycle_each() {
        let gate = Arc::new(Gate::new("update"));
        let cycles = Arc::new(AtomicUsize::new(0));

        let worker = {
            let gate = Arc::clone(&gate);
            let cycles = Arc::clone(&cycles);
            thread::spawn(move || {
                loop {
                    gate.await_permit();
                    if gate.is_shut_down() {
                        break;
                    }
                    cycles.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        for expected in 1..=3 {
            gate.grant_and_wait_consumed();
            assert_eq!(cycles.load(Ordering::SeqCst), expected);
        }

        gate.force_release();
        worker.join().unwrap();
    }

    #[test]
    fn grant_blocks_until_a_worker_arrives() {
        let gate = Arc::new(Gate::new("update"));
        let returned = Arc::new(AtomicBool::new(false));

        let controller = {
            let gate = Arc::clone(&gate);
            let returned = Arc::clone(&returned);
            thread::spawn(move || {
                gate.grant_and_wait_consumed();
                returned.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(
            !returned.load(Ordering::SeqCst),
            "grant returned with no worker parked"
        );

        let worker = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                gate.await_permit();
                gate.await_permit();
            })
        };

        controller.join().unwrap();
        assert!(returned.load(Ordering::SeqCst));

        gate.force_release();
        worker.join().unwrap();
    }

    #[test]
    fn one_permit_is_consumed_by_exactly_one_waiter() {
        let gate = Arc::new(Gate::new("update"));
        let consumed = Arc::new(AtomicUsize::new(0));

        let spawn_waiter = |gate: &Arc<Gate>, consumed: &Arc<AtomicUsize>| {
            let gate = Arc::clone(gate);
            let consumed = Arc::clone(consumed);
            thread::spawn(move || {
                loop {
                    gate.await_permit();
                    if gate.is_shut_down() {
                        break;
                    }
                    consumed.fetch_add(1, Ordering::SeqCst);
                }
            })
        };
        let a = spawn_waiter(&gate, &consumed);
        let b = spawn_waiter(&gate, &consumed);

        gate.grant_and_wait_consumed();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(
            consumed.load(Ordering::SeqCst),
            1,
            "a single permit must release a single waiter"
        );

        gate.force_release();
        a.join().unwrap();
        b.join().unwrap();
    }

    #[test]
    fn force_release_unparks_waiter() {
        let gate = Arc::new(Gate::new("signal"));
        let worker = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || gate.await_permit())
        };
        thread::sleep(Duration::from_millis(10));
        gate.force_release();
        worker.join().unwrap();
    }

    #[test]
    fn await_after_shutdown_returns_immediately() {
        let gate = Gate::new("signal");
        gate.force_release();
        gate.await_permit();
        assert!(gate.is_shut_down());
    }

    #[test]
    fn grant_after_shutdown_returns_immediately() {
        let gate = Gate::new("update");
        gate.force_release();
        gate.grant_and_wait_consumed();
    }
}
