//! Instrumentation backends
//!
//! The controller never touches sampling knobs directly. Every switch it
//! flips (CPU capture, heap sampling rate, block rate, mutex fraction) and
//! every profile it dumps goes through the [`Instrumentation`] trait, so the
//! config stays the single source of truth and tests can swap in a recording
//! backend.
//!
//! [`RuntimeInstrumentation`] is the bundled backend:
//! - `cpu`: signal-based stack sampling via the `pprof` crate
//! - `heap`: allocation sampling through [`crate::alloc::SamplingAllocator`],
//!   or jemalloc's profiler with the `jemalloc` feature
//! - `contention`: block and mutex event records fed by [`crate::sync`]
//! - `threads`: thread dump read from `/proc/self/task`, with every thread's
//!   stack unwound in a signal handler

pub mod contention;
pub mod cpu;
pub mod heap;
pub mod heap_sampler;
pub mod runtime;
pub mod symbols;
pub mod threads;

use std::io::Write;

use crate::domain::{InstrumentationError, ProfileKind};

pub use runtime::RuntimeInstrumentation;

/// Destination of a continuous CPU capture
pub type CaptureSink = Box<dyn Write + Send>;

/// Switches and dump entry points of a profiling subsystem
///
/// Implementations hold process-wide state and must tolerate calls from any
/// thread.
pub trait Instrumentation: Send + Sync {
    /// Set the CPU sampling frequency (Hz) used by the next capture
    ///
    /// # Errors
    /// Returns an error if the backend rejects the rate
    fn set_cpu_profile_rate(&self, hz: i32) -> Result<(), InstrumentationError>;

    /// Begin a continuous CPU capture that is flushed into `sink` on stop
    ///
    /// # Errors
    /// Returns an error if a capture is already running or the sampler
    /// cannot be started
    fn start_cpu_profile(&self, sink: CaptureSink) -> Result<(), InstrumentationError>;

    /// Stop the running CPU capture and flush it. A no-op when nothing runs.
    ///
    /// # Errors
    /// Returns an error if the report cannot be built or written
    fn stop_cpu_profile(&self) -> Result<(), InstrumentationError>;

    /// Average bytes between sampled allocations; 0 turns sampling off
    ///
    /// # Errors
    /// Returns an error if heap sampling is unavailable
    fn set_memory_profile_rate(&self, rate: i64) -> Result<(), InstrumentationError>;

    /// Blocking-event rate in nanoseconds; 1 records every event, 0 turns
    /// recording off
    ///
    /// # Errors
    /// Returns an error if the backend rejects the rate
    fn set_block_profile_rate(&self, rate: i64) -> Result<(), InstrumentationError>;

    /// Record one in `fraction` contention events; values <= 0 turn
    /// recording off
    ///
    /// # Errors
    /// Returns an error if the backend rejects the fraction
    fn set_mutex_profile_fraction(&self, fraction: i64) -> Result<(), InstrumentationError>;

    /// Dump the current profile of `kind` into `out`
    ///
    /// `debug` selects the detail level: 0 for the compact encoding, 1 for
    /// text, 2 for text with full stacks.
    ///
    /// # Errors
    /// Returns an error if the kind is not supported or the write fails
    fn write_profile(
        &self,
        kind: ProfileKind,
        out: &mut dyn Write,
        debug: u8,
    ) -> Result<(), InstrumentationError>;
}
