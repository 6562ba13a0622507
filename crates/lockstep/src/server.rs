//! Embedded-server bootstrap for parallel test instances.
//!
//! A [`ThreadedServer`] hosts one embedded server on a background
//! thread and hands the test a [`StepController`] for it. Before the
//! server starts, the bootstrap gives the instance an identity that
//! cannot collide with other tests running on the same machine:
//!
//! - a random service number and port base, each guarded by an
//!   exclusive lock file (re-rolled on contention),
//! - an instance copy of the config file with the `SERVICE_NUMBER:`
//!   and `PORT_BASE:` lines rewritten,
//! - a symlink of the test executable under the instance name, so
//!   per-instance process naming works,
//! - a per-instance history directory path.
//!
//! Dropping the [`ThreadedServer`] shuts the embedded server down,
//! joins its thread, and removes everything the bootstrap created.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::thread::{self, JoinHandle};

use fs2::FileExt;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::context::HarnessContext;
use crate::controller::StepController;
use crate::runtime::{ControlRuntime, EmbeddedServer};

/// Attempts at allocating an uncontended service number / port base
/// pair before giving up.
const ALLOC_ATTEMPTS: usize = 16;

static SERVICE_NUMBER_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^SERVICE_NUMBER:.*$").unwrap());
static PORT_BASE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^PORT_BASE:.*$").unwrap());

/// Bootstrap failure.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("config file name must end in .conf: {path}")]
    ConfigName { path: PathBuf },

    #[error("could not allocate uncontended instance locks after {attempts} attempts")]
    LockContention { attempts: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Bootstrap options.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Start the server thread from the constructor.
    pub auto_start: bool,
    /// Directory for the allocation lock files. Defaults to the
    /// system temp directory.
    pub lock_dir: Option<PathBuf>,
    /// Directory for the instance config, symlink, and history dir.
    /// Defaults to the config file's directory.
    pub work_dir: Option<PathBuf>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            auto_start: true,
            lock_dir: None,
            work_dir: None,
        }
    }
}

/// Identity of one bootstrapped server instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    /// Name derived from the config file (without `.conf`).
    pub server_name: String,
    /// `<server_name>_<service_number>`.
    pub instance_name: String,
    /// Service number the instance answers on.
    pub service_number: String,
    /// First port of the block reserved for this instance.
    pub port_base: String,
    /// Instance copy of the config file.
    pub config_file: PathBuf,
    /// Where the instance keeps its history files.
    pub history_dir: PathBuf,
}

/// One embedded server on a background thread, plus its controller.
pub struct ThreadedServer<S: EmbeddedServer + 'static> {
    server: Arc<S>,
    controller: StepController,
    instance: InstanceInfo,
    /// Held open for the lifetime of the instance; releasing them is
    /// what allows another test to reuse the numbers.
    locks: Vec<File>,
    /// Files to remove at drop, lock files last.
    cleanup: Vec<PathBuf>,
    thread: Option<JoinHandle<()>>,
}

impl<S: EmbeddedServer + 'static> ThreadedServer<S> {
    /// Bootstrap an instance of `server` configured by `config_file`.
    pub fn new(
        config_file: impl AsRef<Path>,
        server: Arc<S>,
        options: ServerOptions,
    ) -> Result<Self, ServerError> {
        let config_file = config_file.as_ref();
        let server_name = server_name_from(config_file)?;
        let work_dir = options.work_dir.clone().unwrap_or_else(|| {
            let parent = config_file.parent().unwrap_or_else(|| Path::new("."));
            if parent.as_os_str().is_empty() {
                PathBuf::from(".")
            } else {
                parent.to_path_buf()
            }
        });
        let lock_dir = options.lock_dir.clone().unwrap_or_else(std::env::temp_dir);

        let allocation = allocate_instance_numbers(&lock_dir)?;
        let instance_name = format!("{server_name}_{}", allocation.service_number);
        let instance_config = work_dir.join(format!("{instance_name}.conf"));
        let history_dir = work_dir.join(format!("hist_{instance_name}"));

        // Instance copy of the config with the allocated numbers.
        let template = fs::read_to_string(config_file)?;
        let rendered = render_instance_config(
            &template,
            &allocation.service_number,
            &allocation.port_base,
        );
        fs::write(&instance_config, rendered)?;
        let config_lock = File::open(&instance_config)?;
        config_lock.lock_exclusive()?;

        // Per-instance process naming needs an executable under the
        // instance name.
        let symlink_path = work_dir.join(&instance_name);
        std::os::unix::fs::symlink(std::env::current_exe()?, &symlink_path)?;

        let instance = InstanceInfo {
            server_name,
            instance_name,
            service_number: allocation.service_number,
            port_base: allocation.port_base,
            config_file: instance_config.clone(),
            history_dir,
        };
        info!(
            instance = %instance.instance_name,
            service_number = %instance.service_number,
            port_base = %instance.port_base,
            "instance bootstrapped"
        );

        let controller = StepController::new(
            Arc::new(HarnessContext::new()),
            Arc::clone(&server) as Arc<dyn ControlRuntime>,
        );

        let mut threaded = Self {
            server,
            controller,
            instance,
            locks: vec![allocation.service_lock, allocation.ports_lock, config_lock],
            cleanup: vec![
                instance_config,
                symlink_path,
                allocation.service_lock_path,
                allocation.ports_lock_path,
            ],
            thread: None,
        };
        if options.auto_start {
            threaded.start()?;
        }
        Ok(threaded)
    }

    /// Start the embedded server thread. No-op when already started.
    pub fn start(&mut self) -> Result<(), ServerError> {
        if self.thread.is_some() {
            return Ok(());
        }
        let server = Arc::clone(&self.server);
        let instance = self.instance.clone();
        let handle = thread::Builder::new()
            .name(format!("server-{}", instance.instance_name))
            .spawn(move || server.run(&instance))?;
        self.thread = Some(handle);
        info!(instance = %self.instance.instance_name, "embedded server started");
        Ok(())
    }

    /// Controller for this instance.
    #[must_use]
    pub fn controller(&self) -> &StepController {
        &self.controller
    }

    /// Instance identity.
    #[must_use]
    pub fn instance(&self) -> &InstanceInfo {
        &self.instance
    }

    /// Hosted server.
    #[must_use]
    pub fn server(&self) -> &Arc<S> {
        &self.server
    }
}

impl<S: EmbeddedServer + 'static> Drop for ThreadedServer<S> {
    fn drop(&mut self) {
        if let Some(handle) = self.thread.take() {
            self.controller.shutdown();
            if handle.join().is_err() {
                warn!(
                    instance = %self.instance.instance_name,
                    "server thread panicked during shutdown"
                );
            }
        }
        // Release the locks before removing the files backing them.
        self.locks.clear();
        for path in self.cleanup.drain(..) {
            if let Err(err) = fs::remove_file(&path) {
                warn!(path = %path.display(), %err, "instance cleanup failed");
            }
        }
    }
}

struct Allocation {
    service_number: String,
    port_base: String,
    service_lock: File,
    service_lock_path: PathBuf,
    ports_lock: File,
    ports_lock_path: PathBuf,
}

/// Derive the server name from `<name>.conf`.
fn server_name_from(config_file: &Path) -> Result<String, ServerError> {
    let file_name = config_file
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| ServerError::ConfigName {
            path: config_file.to_path_buf(),
        })?;
    file_name
        .strip_suffix(".conf")
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ServerError::ConfigName {
            path: config_file.to_path_buf(),
        })
}

/// Roll random instance numbers until both lock files are ours.
fn allocate_instance_numbers(lock_dir: &Path) -> Result<Allocation, ServerError> {
    let mut rng = rand::rng();
    for _ in 0..ALLOC_ATTEMPTS {
        let service_number = rng.random_range(620_000_000..=999_999_999_u64).to_string();
        // Port blocks come in steps of 10. The low range commonly used
        // by permanently configured servers on shared machines is
        // avoided by starting at 20000.
        let port_base = (rng.random_range(2_000..=6_500_u32) * 10).to_string();

        let service_lock_path = lock_dir.join(format!("service_{service_number}.lock"));
        let ports_lock_path = lock_dir.join(format!("ports_{port_base}.lock"));

        let service_lock = File::create(&service_lock_path)?;
        if service_lock.try_lock_exclusive().is_err() {
            continue;
        }
        let ports_lock = File::create(&ports_lock_path)?;
        if ports_lock.try_lock_exclusive().is_err() {
            // Also drops the service lock; both get re-rolled.
            continue;
        }

        return Ok(Allocation {
            service_number,
            port_base,
            service_lock,
            service_lock_path,
            ports_lock,
            ports_lock_path,
        });
    }
    Err(ServerError::LockContention {
        attempts: ALLOC_ATTEMPTS,
    })
}

/// Rewrite the `SERVICE_NUMBER:` and `PORT_BASE:` lines of a config
/// template; all other lines pass through untouched.
fn render_instance_config(template: &str, service_number: &str, port_base: &str) -> String {
    let with_service = SERVICE_NUMBER_LINE.replace_all(
        template,
        format!("SERVICE_NUMBER: {service_number}").as_str(),
    );
    PORT_BASE_LINE
        .replace_all(&with_service, format!("PORT_BASE: {port_base}").as_str())
        .into_owned()
}
