//! Process-wide instrumentation backend
//!
//! Routes every knob of [`Instrumentation`] to the bundled subsystems. The
//! block, mutex and heap state is process-wide; the CPU sampler belongs to the
//! instance, but the underlying `pprof` profiler still allows only one running
//! capture per process.

use std::io::Write;

use super::contention::{block_profile, mutex_profile};
use super::cpu::CpuSampler;
use super::{heap, threads, CaptureSink, Instrumentation};
use crate::domain::{InstrumentationError, ProfileKind};

/// Bundled backend: `pprof` CPU sampling, allocator heap sampling, block and
/// mutex records from [`crate::sync`], `/proc` thread dumps
#[derive(Default)]
pub struct RuntimeInstrumentation {
    cpu: CpuSampler,
}

impl RuntimeInstrumentation {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Instrumentation for RuntimeInstrumentation {
    fn set_cpu_profile_rate(&self, hz: i32) -> Result<(), InstrumentationError> {
        self.cpu.set_frequency(hz);
        Ok(())
    }

    fn start_cpu_profile(&self, sink: CaptureSink) -> Result<(), InstrumentationError> {
        self.cpu.start(sink)
    }

    fn stop_cpu_profile(&self) -> Result<(), InstrumentationError> {
        self.cpu.stop()
    }

    fn set_memory_profile_rate(&self, rate: i64) -> Result<(), InstrumentationError> {
        heap::set_sample_rate(rate)
    }

    fn set_block_profile_rate(&self, rate: i64) -> Result<(), InstrumentationError> {
        block_profile().set_rate(rate);
        Ok(())
    }

    fn set_mutex_profile_fraction(&self, fraction: i64) -> Result<(), InstrumentationError> {
        mutex_profile().set_rate(fraction);
        Ok(())
    }

    fn write_profile(
        &self,
        kind: ProfileKind,
        out: &mut dyn Write,
        debug: u8,
    ) -> Result<(), InstrumentationError> {
        match kind {
            ProfileKind::Memory => heap::write_profile(out),
            ProfileKind::Block => block_profile().write_text(out, debug),
            ProfileKind::Mutex => mutex_profile().write_text(out, debug),
            ProfileKind::Goroutine => threads::write_thread_dump(out, debug),
            // CPU data only leaves through the capture sink
            ProfileKind::Cpu => Err(InstrumentationError::Unsupported(ProfileKind::Cpu)),
        }
    }
}
