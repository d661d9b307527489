//! Continuous CPU capture
//!
//! Wraps a `pprof` profiler guard. The guard samples from the moment it is
//! built; on stop the collected report is encoded as pprof protobuf and
//! written to the sink handed over at start.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, PoisonError};

use log::debug;
use pprof::protos::Message;

use super::CaptureSink;
use crate::domain::InstrumentationError;

/// Sampling frequency used when no rate is configured
pub const DEFAULT_FREQUENCY_HZ: i32 = 100;

struct Capture {
    guard: pprof::ProfilerGuard<'static>,
    sink: CaptureSink,
}

/// CPU sampler holding at most one running capture
pub struct CpuSampler {
    frequency: AtomicI32,
    active: Mutex<Option<Capture>>,
}

impl CpuSampler {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            frequency: AtomicI32::new(DEFAULT_FREQUENCY_HZ),
            active: Mutex::new(None),
        }
    }

    /// Frequency the next capture will sample at
    #[must_use]
    pub fn frequency(&self) -> i32 {
        self.frequency.load(Ordering::Relaxed)
    }

    /// Set the frequency for the next capture; non-positive values are ignored
    pub fn set_frequency(&self, hz: i32) {
        if hz > 0 {
            self.frequency.store(hz, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }

    /// Start sampling into `sink`
    ///
    /// # Errors
    /// Returns an error if a capture is already running or the profiler
    /// cannot install its signal handler
    pub fn start(&self, sink: CaptureSink) -> Result<(), InstrumentationError> {
        let mut slot = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(InstrumentationError::CpuAlreadyRunning);
        }

        let frequency = self.frequency();
        let guard = pprof::ProfilerGuardBuilder::default()
            .frequency(frequency)
            .build()
            .map_err(|e| InstrumentationError::Backend(format!("start CPU profiler: {e}")))?;
        debug!("CPU sampling started at {frequency} Hz");

        *slot = Some(Capture { guard, sink });
        Ok(())
    }

    /// Stop sampling and flush the report into the sink given at start
    ///
    /// # Errors
    /// Returns an error if the report cannot be built, encoded or written
    pub fn stop(&self) -> Result<(), InstrumentationError> {
        let Some(Capture { guard, mut sink }) =
            self.active.lock().unwrap_or_else(PoisonError::into_inner).take()
        else {
            debug!("CPU sampling not running, nothing to stop");
            return Ok(());
        };

        let report = guard
            .report()
            .build()
            .map_err(|e| InstrumentationError::Backend(format!("build CPU report: {e}")))?;
        // Dropping the guard stops the sampling timer
        drop(guard);

        let profile = report
            .pprof()
            .map_err(|e| InstrumentationError::Backend(format!("encode CPU report: {e}")))?;
        sink.write_all(&profile.encode_to_vec())?;
        sink.flush()?;
        Ok(())
    }
}

impl Default for CpuSampler {
    fn default() -> Self {
        Self::new()
    }
}
