//! # Profiler Controller
//!
//! Owns the lifecycle of one profiling session:
//!
//! ```text
//!   run() ──▶ activate ──▶ ┌──────────── select! ────────────┐
//!                          │ timer expired   │ stop() called  │
//!                          ▼                 ▼                │
//!                   take_snapshot()    take_snapshot()        │
//!                   activate again     return Stopped         │
//!                          └──────────▶ next cycle ───────────┘
//! ```
//!
//! The termination signal is a zero-capacity `crossbeam-channel` nobody ever
//! sends on. `stop()` drops the only sender; every receiver then observes the
//! disconnection, which makes the signal a one-shot broadcast.
//!
//! Resources opened during activation (the CPU capture file) are queued as
//! cleanup actions and released by the next snapshot, whichever path
//! triggers it.

mod artifact;
mod snapshot;

use std::fs::File;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use log::{error, info, warn};

use crate::config::Config;
use crate::domain::{InstrumentationError, ProfileKind, ProfilerError, UnixSeconds};
use crate::instrumentation::{Instrumentation, RuntimeInstrumentation};

pub use artifact::{artifact_path, system_now};
pub use snapshot::{ArtifactOutcome, SnapshotReport};

/// A deferred resource release, due at the next snapshot
pub type Cleanup = Box<dyn FnOnce() + Send>;

type Clock = Box<dyn Fn() -> UnixSeconds + Send + Sync>;

/// How a [`ProfilerController::run`] call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Nothing enabled or no interval: subsystems were activated and
    /// snapshots are left to the caller
    Activated,
    /// The loop observed `stop()` and took its final snapshot
    Stopped {
        /// Snapshots taken by the loop, the final one included
        snapshots: usize,
    },
}

/// The open CPU artifact, and why the capture into it never started
struct CpuArtifact {
    path: PathBuf,
    start_error: Option<InstrumentationError>,
}

/// Activates profiling subsystems and writes their snapshots to disk
///
/// Share it as `Arc<ProfilerController>`: one thread blocks in
/// [`run`](Self::run) while others call [`stop`](Self::stop) or
/// [`take_snapshot`](Self::take_snapshot).
pub struct ProfilerController {
    config: Config,
    instrumentation: Arc<dyn Instrumentation>,
    terminate_tx: Mutex<Option<Sender<()>>>,
    terminate_rx: Receiver<()>,
    cleanups: Mutex<Vec<Cleanup>>,
    /// Artifact currently receiving the continuous CPU capture
    cpu_artifact: Mutex<Option<CpuArtifact>>,
    clock: Clock,
}

impl ProfilerController {
    /// Create a controller driving the process-wide runtime instrumentation
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_instrumentation(config, Arc::new(RuntimeInstrumentation::new()))
    }

    /// Create a controller driving the given backend
    #[must_use]
    pub fn with_instrumentation(config: Config, instrumentation: Arc<dyn Instrumentation>) -> Self {
        let (terminate_tx, terminate_rx) = bounded(0);
        Self {
            config,
            instrumentation,
            terminate_tx: Mutex::new(Some(terminate_tx)),
            terminate_rx,
            cleanups: Mutex::new(Vec::new()),
            cpu_artifact: Mutex::new(None),
            clock: Box::new(system_now),
        }
    }

    /// Replace the wall clock used to timestamp artifact names
    #[must_use]
    pub fn with_clock(mut self, clock: impl Fn() -> UnixSeconds + Send + Sync + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Activate the enabled subsystems and, with an interval configured,
    /// snapshot on every tick until [`stop`](Self::stop) is called
    ///
    /// Without an enabled kind or an interval this returns right after
    /// activation. Otherwise it blocks; run it on its own thread.
    ///
    /// # Errors
    /// - [`ProfilerError::CpuArtifact`] if the CPU capture file cannot be
    ///   created (nothing after CPU is activated)
    /// - [`ProfilerError::InvalidInterval`] if the interval does not parse;
    ///   the subsystems stay activated
    pub fn run(&self) -> Result<RunOutcome, ProfilerError> {
        self.activate()?;

        if !self.config.is_on() {
            return Ok(RunOutcome::Activated);
        }
        let interval = match self.config.parse_interval() {
            Ok(Some(interval)) => interval,
            Ok(None) => return Ok(RunOutcome::Activated),
            Err(e) => {
                error!("Error parsing interval parameter: {e}");
                return Err(e.into());
            }
        };

        let mut snapshots = 0;
        loop {
            let timer = crossbeam_channel::after(interval);
            select! {
                recv(timer) -> _ => {
                    self.take_snapshot();
                    snapshots += 1;
                    self.activate()?;
                }
                recv(self.terminate_rx) -> _ => {
                    self.take_snapshot();
                    snapshots += 1;
                    return Ok(RunOutcome::Stopped { snapshots });
                }
            }
        }
    }

    /// Signal the loop in [`run`](Self::run) to take a final snapshot and
    /// return. Never blocks; calls after the first only log a warning.
    pub fn stop(&self) {
        if lock(&self.terminate_tx).take().is_some() {
            info!("Stopping profiler");
        } else {
            warn!("Profiler already stopped");
        }
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        lock(&self.terminate_tx).is_none()
    }

    /// Cleanup actions waiting for the next snapshot
    #[must_use]
    pub fn pending_cleanups(&self) -> usize {
        lock(&self.cleanups).len()
    }

    /// Queue an action to run at the end of the next snapshot
    pub fn defer_cleanup(&self, cleanup: impl FnOnce() + Send + 'static) {
        lock(&self.cleanups).push(Box::new(cleanup));
    }

    fn activate(&self) -> Result<(), ProfilerError> {
        let config = &self.config;
        if config.cpu {
            if config.cpu_profile_rate > 0 {
                apply_knob(
                    "set CPU profile rate",
                    self.instrumentation.set_cpu_profile_rate(config.cpu_profile_rate),
                );
            }
            self.start_profiling_cpu()?;
        }
        if config.memory {
            info!("Memory profile rate: {}", config.memory_profile_rate);
            apply_knob(
                "set memory profile rate",
                self.instrumentation.set_memory_profile_rate(config.memory_profile_rate),
            );
        }
        if config.block {
            info!("Block profiling enabled");
            apply_knob("set block profile rate", self.instrumentation.set_block_profile_rate(1));
        }
        if config.mutex {
            info!("Mutex profile fraction: {}", config.mutex_profile_fraction);
            apply_knob(
                "set mutex profile fraction",
                self.instrumentation.set_mutex_profile_fraction(config.mutex_profile_fraction),
            );
        }
        Ok(())
    }

    /// Open a fresh CPU artifact and start capturing into it
    fn start_profiling_cpu(&self) -> Result<(), ProfilerError> {
        let path = artifact_path(&self.config.prefix, ProfileKind::Cpu, self.now());
        info!("Starting new CPU Profiler: {}", path.display());

        let (file, sink) = File::create(&path)
            .and_then(|file| file.try_clone().map(|sink| (file, sink)))
            .map_err(|source| {
                error!("Failed to create CPU profile {}: {source}", path.display());
                ProfilerError::CpuArtifact { path: path.clone(), source }
            })?;

        let start_error = self.instrumentation.start_cpu_profile(Box::new(sink)).err();
        if let Some(e) = &start_error {
            warn!("could not start CPU profile: {e}");
        }
        *lock(&self.cpu_artifact) = Some(CpuArtifact { path: path.clone(), start_error });

        self.defer_cleanup(move || {
            if let Err(e) = file.sync_all() {
                warn!("Failed to close {}: {e}", path.display());
            }
        });
        Ok(())
    }

    fn now(&self) -> UnixSeconds {
        (self.clock)()
    }
}

impl Drop for ProfilerController {
    fn drop(&mut self) {
        // Flush the capture before its file is closed
        let capturing = lock(&self.cpu_artifact).take().is_some();
        if capturing {
            if let Err(e) = self.instrumentation.stop_cpu_profile() {
                warn!("could not stop CPU profile: {e}");
            }
        }

        let cleanups = std::mem::take(&mut *lock(&self.cleanups));
        if !cleanups.is_empty() {
            warn!("Dropping profiler with {} pending cleanups, running them now", cleanups.len());
            for cleanup in cleanups {
                cleanup();
            }
        }
    }
}

/// Knob failures never abort activation or a snapshot
fn apply_knob(what: &str, result: Result<(), InstrumentationError>) {
    if let Err(e) = result {
        warn!("could not {what}: {e}");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
