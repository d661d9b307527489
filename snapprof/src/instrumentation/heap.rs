//! Heap allocation sampling
//!
//! Two backends, chosen at build time:
//! - default: [`crate::alloc::SamplingAllocator`] installed as the host's
//!   global allocator feeds the in-process sampler in [`super::heap_sampler`]
//! - `jemalloc` feature: jemalloc's `prof` API. The host binary must install
//!   `tikv_jemallocator::Jemalloc` as its global allocator and export a
//!   `malloc_conf` containing `prof:true`; without that jemalloc exposes no
//!   profiling control and every call reports an error.
//!
//! The sampling rate is the average number of allocated bytes between two
//! samples. jemalloc only supports powers of two, so there the rate is rounded
//! down to a power of two (`prof.reset` with `lg_sample = floor(log2(rate))`).
//!
//! With jemalloc both entry points lock its profiling control with a blocking
//! lock and must not be called from inside an async runtime.

use std::io::Write;

use crate::domain::InstrumentationError;

/// log2 of the sampling interval for a byte rate, floored
#[must_use]
pub fn lg_sample(rate: i64) -> usize {
    u64::try_from(rate)
        .ok()
        .filter(|r| *r > 0)
        .map_or(0, |r| usize::try_from(r.ilog2()).unwrap_or(0))
}

#[cfg(feature = "jemalloc")]
mod imp {
    use std::io::Write;

    use jemalloc_pprof::PROF_CTL;
    use log::debug;

    use super::lg_sample;
    use crate::domain::InstrumentationError;

    fn backend_error(context: &str, e: impl std::fmt::Display) -> InstrumentationError {
        InstrumentationError::Backend(format!("{context}: {e}"))
    }

    pub fn set_sample_rate(rate: i64) -> Result<(), InstrumentationError> {
        let ctl = PROF_CTL
            .as_ref()
            .ok_or_else(|| backend_error("jemalloc", "profiling control not available"))?;
        let mut ctl = ctl.blocking_lock();

        if rate <= 0 {
            if ctl.activated() {
                ctl.deactivate().map_err(|e| backend_error("deactivate heap profiling", e))?;
            }
            return Ok(());
        }

        let lg = lg_sample(rate);
        // SAFETY: `prof.reset` is a writable size_t control; resetting only
        // discards the samples collected so far.
        #[allow(unsafe_code)]
        let reset = unsafe { tikv_jemalloc_ctl::raw::write(b"prof.reset\0", lg) };
        reset.map_err(|e| backend_error("reset heap profile", e))?;
        if !ctl.activated() {
            ctl.activate().map_err(|e| backend_error("activate heap profiling", e))?;
        }
        debug!("heap sampling every 2^{lg} bytes");
        Ok(())
    }

    pub fn write_profile(out: &mut dyn Write) -> Result<(), InstrumentationError> {
        let ctl = PROF_CTL
            .as_ref()
            .ok_or_else(|| backend_error("jemalloc", "profiling control not available"))?;
        let mut ctl = ctl.blocking_lock();
        if !ctl.activated() {
            return Err(backend_error("jemalloc", "heap profiling is not active"));
        }
        let bytes = ctl.dump_pprof().map_err(|e| backend_error("dump heap profile", e))?;
        out.write_all(&bytes)?;
        Ok(())
    }
}

#[cfg(not(feature = "jemalloc"))]
mod imp {
    use std::io::Write;

    use log::debug;

    use crate::domain::InstrumentationError;
    use crate::instrumentation::heap_sampler::heap_sampler;

    pub fn set_sample_rate(rate: i64) -> Result<(), InstrumentationError> {
        let sampler = heap_sampler();
        sampler.set_rate(rate);
        if rate > 0 && !sampler.is_installed() {
            debug!("heap sampling rate set before any allocation went through SamplingAllocator");
        }
        Ok(())
    }

    pub fn write_profile(out: &mut dyn Write) -> Result<(), InstrumentationError> {
        let sampler = heap_sampler();
        if !sampler.is_installed() {
            return Err(InstrumentationError::Backend(
                "heap profiling needs snapprof::alloc::SamplingAllocator as the global allocator"
                    .to_string(),
            ));
        }
        sampler.write_pprof(out)
    }
}

/// Apply a heap sampling rate
///
/// # Errors
/// Returns an error if heap profiling is unavailable
pub fn set_sample_rate(rate: i64) -> Result<(), InstrumentationError> {
    imp::set_sample_rate(rate)
}

/// Dump the current heap profile as pprof protobuf
///
/// # Errors
/// Returns an error if heap profiling is unavailable or inactive
pub fn write_profile(out: &mut dyn Write) -> Result<(), InstrumentationError> {
    imp::write_profile(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lg_sample() {
        assert_eq!(lg_sample(1), 0);
        assert_eq!(lg_sample(2), 1);
        assert_eq!(lg_sample(3), 1);
        assert_eq!(lg_sample(512 * 1024), 19);
        assert_eq!(lg_sample(0), 0);
        assert_eq!(lg_sample(-4), 0);
    }

    #[cfg(not(feature = "jemalloc"))]
    #[test]
    fn test_sampler_backend_needs_allocator() {
        // Unit tests run on the system allocator, so nothing feeds the sampler
        assert!(set_sample_rate(0).is_ok());
        let mut out = Vec::new();
        assert!(matches!(write_profile(&mut out), Err(InstrumentationError::Backend(_))));
        assert!(out.is_empty());
    }
}
