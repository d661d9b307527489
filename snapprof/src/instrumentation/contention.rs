//! Block and mutex event profiles
//!
//! Rust has no runtime hook that reports blocked waits, so the events come
//! from the instrumented primitives in [`crate::sync`]. Each sampled event is
//! attributed to the stack of the waiting thread and folded into a
//! per-stack record (event count and total delay). Records accumulate for the
//! life of the process; changing the rate only changes what gets recorded
//! from then on.
//!
//! Sampling:
//! - block: the rate is in nanoseconds. Events at least `rate` long are
//!   always recorded; shorter ones are recorded once their accumulated delay
//!   reaches `rate`. A rate of 1 records everything.
//! - mutex: one in `fraction` contention events is recorded.

use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Duration;

use crate::domain::InstrumentationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sampling {
    /// Rate is a delay threshold in nanoseconds
    Delay,
    /// Rate is N in "one in N events"
    OneInN,
}

/// Per-stack totals
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EventRecord {
    pub count: u64,
    pub delay_ns: u64,
}

/// Accumulated events of one kind (block or mutex)
#[derive(Debug)]
pub struct EventProfile {
    name: &'static str,
    sampling: Sampling,
    rate: AtomicI64,
    seen: AtomicU64,
    carried_ns: AtomicU64,
    records: Mutex<HashMap<String, EventRecord>>,
}

impl EventProfile {
    fn new(name: &'static str, sampling: Sampling) -> Self {
        Self {
            name,
            sampling,
            rate: AtomicI64::new(0),
            seen: AtomicU64::new(0),
            carried_ns: AtomicU64::new(0),
            records: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn rate(&self) -> i64 {
        self.rate.load(Ordering::Relaxed)
    }

    pub fn set_rate(&self, rate: i64) {
        self.rate.store(rate, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.rate() > 0
    }

    /// Offer one event; records it with the caller's stack when sampled
    pub fn record(&self, delay: Duration) {
        if self.should_sample(delay) {
            let stack = Backtrace::force_capture().to_string();
            self.insert(stack, delay);
        }
    }

    fn should_sample(&self, delay: Duration) -> bool {
        let Ok(rate) = u64::try_from(self.rate()) else {
            return false;
        };
        if rate == 0 {
            return false;
        }

        match self.sampling {
            Sampling::OneInN => self.seen.fetch_add(1, Ordering::Relaxed) % rate == 0,
            Sampling::Delay => {
                let delay_ns = u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX);
                if delay_ns >= rate {
                    return true;
                }
                let carried = self
                    .carried_ns
                    .fetch_add(delay_ns, Ordering::Relaxed)
                    .saturating_add(delay_ns);
                if carried >= rate {
                    self.carried_ns.fetch_sub(rate, Ordering::Relaxed);
                    true
                } else {
                    false
                }
            }
        }
    }

    fn insert(&self, stack: String, delay: Duration) {
        let delay_ns = u64::try_from(delay.as_nanos()).unwrap_or(u64::MAX);
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let record = records.entry(stack).or_default();
        record.count += 1;
        record.delay_ns = record.delay_ns.saturating_add(delay_ns);
    }

    /// Copy of the current records, heaviest stacks first
    #[must_use]
    pub fn records(&self) -> Vec<(String, EventRecord)> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<(String, EventRecord)> =
            records.iter().map(|(stack, record)| (stack.clone(), *record)).collect();
        out.sort_by(|a, b| b.1.delay_ns.cmp(&a.1.delay_ns).then_with(|| a.0.cmp(&b.0)));
        out
    }

    /// Write the text rendition of the profile
    ///
    /// Debug 0 and 1 write the per-stack totals; 2 adds the stacks.
    ///
    /// # Errors
    /// Returns an error if writing to `out` fails
    pub fn write_text(&self, out: &mut dyn Write, debug: u8) -> Result<(), InstrumentationError> {
        let records = self.records();
        let total_events: u64 = records.iter().map(|(_, r)| r.count).sum();
        let total_delay: u64 =
            records.iter().fold(0u64, |acc, (_, r)| acc.saturating_add(r.delay_ns));

        writeln!(out, "--- {} profile", self.name)?;
        writeln!(out, "rate={}", self.rate())?;
        writeln!(out, "stacks={} events={total_events} delay_ns={total_delay}", records.len())?;

        for (stack, record) in &records {
            writeln!(out)?;
            writeln!(out, "{} {}", record.delay_ns, record.count)?;
            if debug >= 2 {
                for line in stack.lines() {
                    writeln!(out, "#\t{}", line.trim_start())?;
                }
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn clear(&self) {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).clear();
        self.seen.store(0, Ordering::Relaxed);
        self.carried_ns.store(0, Ordering::Relaxed);
    }
}

/// Process-wide blocking-event profile
pub fn block_profile() -> &'static EventProfile {
    static BLOCK: OnceLock<EventProfile> = OnceLock::new();
    BLOCK.get_or_init(|| EventProfile::new("block", Sampling::Delay))
}

/// Process-wide mutex-contention profile
pub fn mutex_profile() -> &'static EventProfile {
    static MUTEX: OnceLock<EventProfile> = OnceLock::new();
    MUTEX.get_or_init(|| EventProfile::new("mutex", Sampling::OneInN))
}
