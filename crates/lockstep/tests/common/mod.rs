//! Simulated equipment server shared by the integration tests.
//!
//! `SimServer` stands in for the opaque framework runtime: one worker
//! thread loops over tick-wait/update, another over
//! signal-wait/interrupt, both across a set of registered locations.
//! Cycle completions are pushed onto a channel so tests can assert
//! exact ordering.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;

use crossbeam::channel::{Receiver, Sender, unbounded};
use nix::sys::signal::SigSet;
use parking_lot::Mutex;

use lockstep::{
    ControlRuntime, EmbeddedServer, HarnessContext, INTERRUPT_SIGNAL, InstanceInfo, PropertyAccess,
    PropertyError, PropertyValue, TICK_SENTINEL, WaitProvider, parse_address,
};

/// One completed callback cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleEvent {
    Update,
    Interrupt,
}

/// A registered equipment location.
pub struct SimLocation {
    pub name: &'static str,
    updates: AtomicUsize,
    interrupts: AtomicUsize,
    properties: Mutex<HashMap<String, PropertyValue>>,
}

impl SimLocation {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            updates: AtomicUsize::new(0),
            interrupts: AtomicUsize::new(0),
            properties: Mutex::new(HashMap::new()),
        }
    }

    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn interrupts(&self) -> usize {
        self.interrupts.load(Ordering::SeqCst)
    }
}

/// Simulated framework runtime.
pub struct SimServer {
    waits: Mutex<Option<Arc<dyn WaitProvider>>>,
    exit: AtomicBool,
    locations: Vec<SimLocation>,
    events_tx: Sender<CycleEvent>,
    events_rx: Receiver<CycleEvent>,
    armed_probe: Mutex<Option<Arc<HarnessContext>>>,
}

impl SimServer {
    pub fn with_locations(names: &[&'static str]) -> Arc<Self> {
        let (events_tx, events_rx) = unbounded();
        Arc::new(Self {
            waits: Mutex::new(None),
            exit: AtomicBool::new(false),
            locations: names.iter().map(|n| SimLocation::new(n)).collect(),
            events_tx,
            events_rx,
            armed_probe: Mutex::new(None),
        })
    }

    /// Model a runtime whose workers issue their first wait only after
    /// interception is armed, the configuration that needs no
    /// boot-time signal release. Without this, a worker racing ahead
    /// of `initialise` parks in the *real* OS wait and needs
    /// displacement (see the boot_displacement test).
    pub fn hold_workers_until_armed(&self, ctx: Arc<HarnessContext>) {
        *self.armed_probe.lock() = Some(ctx);
    }

    fn wait_until_armed(&self) {
        let probe = self.armed_probe.lock().clone();
        if let Some(ctx) = probe {
            while !ctx.is_armed() && !self.exit.load(Ordering::SeqCst) {
                thread::sleep(std::time::Duration::from_millis(1));
            }
        }
    }

    pub fn locations(&self) -> &[SimLocation] {
        &self.locations
    }

    pub fn location(&self, name: &str) -> &SimLocation {
        self.locations
            .iter()
            .find(|l| l.name == name)
            .expect("location registered")
    }

    /// Completed cycles, in order, without blocking.
    pub fn drain_events(&self) -> Vec<CycleEvent> {
        self.events_rx.try_iter().collect()
    }

    fn waits(&self) -> Arc<dyn WaitProvider> {
        Arc::clone(
            self.waits
                .lock()
                .as_ref()
                .expect("wait provider installed before run"),
        )
    }

    fn update_loop(&self, waits: &dyn WaitProvider) {
        self.wait_until_armed();
        while !self.exit.load(Ordering::SeqCst) {
            waits.tick_wait(TICK_SENTINEL);
            if self.exit.load(Ordering::SeqCst) {
                break;
            }
            for location in &self.locations {
                location.updates.fetch_add(1, Ordering::SeqCst);
            }
            let _ = self.events_tx.send(CycleEvent::Update);
        }
    }

    fn interrupt_loop(&self, waits: &dyn WaitProvider) {
        self.wait_until_armed();
        let mut set = SigSet::empty();
        set.add(INTERRUPT_SIGNAL);
        while !self.exit.load(Ordering::SeqCst) {
            if waits.signal_wait(&set).is_err() {
                break;
            }
            if self.exit.load(Ordering::SeqCst) {
                break;
            }
            for location in &self.locations {
                location.interrupts.fetch_add(1, Ordering::SeqCst);
            }
            let _ = self.events_tx.send(CycleEvent::Interrupt);
        }
    }
}

impl ControlRuntime for SimServer {
    fn install_wait_provider(&self, waits: Arc<dyn WaitProvider>) {
        *self.waits.lock() = Some(waits);
    }

    fn request_exit(&self) {
        self.exit.store(true, Ordering::SeqCst);
    }
}

impl PropertyAccess for SimServer {
    fn read_property(&self, name: &str) -> Result<PropertyValue, PropertyError> {
        let (location, property) = parse_address(name)?;
        let location = self
            .locations
            .iter()
            .find(|l| l.name == location)
            .ok_or_else(|| PropertyError::LocationNotFound {
                name: name.to_string(),
            })?;
        location
            .properties
            .lock()
            .get(property)
            .cloned()
            .ok_or_else(|| PropertyError::ReadFailed {
                name: name.to_string(),
                reason: "no such property".to_string(),
            })
    }

    fn write_property(&self, name: &str, value: PropertyValue) -> Result<(), PropertyError> {
        let (location, property) = parse_address(name)?;
        let location = self
            .locations
            .iter()
            .find(|l| l.name == location)
            .ok_or_else(|| PropertyError::LocationNotFound {
                name: name.to_string(),
            })?;
        location
            .properties
            .lock()
            .insert(property.to_string(), value);
        Ok(())
    }
}

impl EmbeddedServer for SimServer {
    fn run(&self, _instance: &InstanceInfo) {
        let waits = self.waits();
        thread::scope(|scope| {
            scope.spawn(|| self.update_loop(&*waits));
            scope.spawn(|| self.interrupt_loop(&*waits));
        });
    }
}

/// Instance identity for tests that drive the runtime without the
/// filesystem bootstrap.
pub fn dummy_instance() -> InstanceInfo {
    InstanceInfo {
        server_name: "sim".to_string(),
        instance_name: "sim_620000000".to_string(),
        service_number: "620000000".to_string(),
        port_base: "20000".to_string(),
        config_file: "sim_620000000.conf".into(),
        history_dir: "hist_sim_620000000".into(),
    }
}

/// Route `tracing` output through the test harness when asked for.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
