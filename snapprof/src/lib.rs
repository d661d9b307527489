//! # snapprof - Periodic Profiling Snapshots
//!
//! snapprof is an embeddable profiling controller. A host application
//! enables one or more kinds of runtime instrumentation through a
//! declarative [`Config`] and gets pprof-style artifacts written to disk,
//! either on a fixed interval or whenever it asks for one.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Host Application                         │
//! │       Config ──▶ ProfilerController::run() (own thread)          │
//! │                  take_snapshot() / stop() (any thread)           │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ knobs + dumps
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   Instrumentation (trait)                       │
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐         │
//! │  │     CPU      │  │     Heap     │  │  Contention  │         │
//! │  │   (pprof)    │  │  (sampling)  │  │ (block/mutex)│         │
//! │  └──────────────┘  └──────────────┘  └──────┬───────┘         │
//! │  ┌──────────────┐                           │                  │
//! │  │   Threads    │                    fed by sync::Mutex,       │
//! │  │ (/proc/self) │                    measure_blocking          │
//! │  └──────────────┘                                               │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ one file per kind per snapshot
//!                         ▼
//!            <prefix><kind>.<unix-seconds>.pprof
//! ```
//!
//! ## Module Structure
//!
//! - [`controller`]: activation, the timer/termination loop, snapshots and
//!   deferred cleanups
//! - [`config`]: the settings record, JSON loading and the interval grammar
//! - [`instrumentation`]: the [`Instrumentation`] seam and the bundled
//!   process-wide backend
//! - [`sync`]: primitives that feed the block and mutex profiles
//! - [`alloc`]: the sampling global allocator behind the memory profile
//! - [`domain`]: profile kinds, newtypes and error enums
//! - [`cli`]: command-line arguments of the `snapprof` binary
//!
//! ## Typical Usage
//!
//! Memory profiles need [`alloc::SamplingAllocator`] installed as the
//! `#[global_allocator]` of the host binary.
//!
//! ```no_run
//! use std::sync::Arc;
//! use snapprof::{Config, ProfilerController};
//!
//! let config = Config {
//!     cpu: true,
//!     memory: true,
//!     prefix: "/tmp/myapp.".to_string(),
//!     interval: "30s".to_string(),
//!     ..Config::default()
//! };
//! let controller = Arc::new(ProfilerController::new(config));
//! let runner = Arc::clone(&controller);
//! let handle = std::thread::spawn(move || runner.run());
//!
//! // ... application work ...
//!
//! controller.stop();
//! handle.join().ok();
//! ```

pub mod alloc;
pub mod cli;
pub mod config;
pub mod controller;
pub mod domain;
pub mod instrumentation;
pub mod sync;

pub use config::{parse_interval, Config};
pub use controller::{artifact_path, ArtifactOutcome, ProfilerController, RunOutcome, SnapshotReport};
pub use domain::{
    ConfigError, InstrumentationError, IntervalError, ProfileKind, ProfilerError, SnapshotError,
    UnixSeconds,
};
pub use instrumentation::{Instrumentation, RuntimeInstrumentation};
