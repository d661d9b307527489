//! In-process heap sampler
//!
//! Fed by [`crate::alloc::SamplingAllocator`]. Each thread counts down the
//! bytes it allocates; when the countdown crosses zero the allocation is
//! sampled, its stack captured and the countdown rearmed with the current
//! rate. Sampled pointers stay tracked until they are freed, which gives the
//! in-use side of the profile.
//!
//! The dump is a pprof protobuf with four sample values per stack:
//! `alloc_objects`, `alloc_space`, `inuse_objects` and `inuse_space`.
//! Values are raw sampled counts; `period` carries the rate.

use std::cell::Cell;
use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use pprof::protos::{Function, Line, Location, Message, Profile, Sample, ValueType};

use super::symbols::{resolve, ResolvedFrame};
use crate::domain::InstrumentationError;

/// Deepest stack kept per sample
pub const MAX_DEPTH: usize = 48;

thread_local! {
    static IN_SAMPLER: Cell<bool> = const { Cell::new(false) };
    static BYTES_UNTIL_SAMPLE: Cell<i64> = const { Cell::new(0) };
}

/// Marks the current thread as busy inside the sampler. Allocations made
/// while it is held pass through unsampled.
struct ReentryGuard;

impl ReentryGuard {
    fn enter() -> Option<Self> {
        IN_SAMPLER
            .try_with(|busy| if busy.replace(true) { None } else { Some(Self) })
            .ok()
            .flatten()
    }
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        let _ = IN_SAMPLER.try_with(|busy| busy.set(false));
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct StackKey {
    depth: usize,
    ips: [usize; MAX_DEPTH],
}

impl StackKey {
    #[allow(unsafe_code)]
    fn capture() -> Self {
        let mut key = Self { depth: 0, ips: [0; MAX_DEPTH] };
        // SAFETY: the callback only writes into `key`; the reentry guard keeps
        // this thread from unwinding twice at once
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                key.ips[key.depth] = frame.ip() as usize;
                key.depth += 1;
                key.depth < MAX_DEPTH
            });
        }
        key
    }

    fn ips(&self) -> &[usize] {
        &self.ips[..self.depth]
    }
}

/// Sampled totals of one allocation stack
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapRecord {
    pub alloc_objects: u64,
    pub alloc_bytes: u64,
    pub inuse_objects: u64,
    pub inuse_bytes: u64,
}

#[derive(Default)]
struct Tables {
    stacks: HashMap<StackKey, HeapRecord>,
    live: HashMap<usize, (StackKey, u64)>,
}

/// Process-wide sampling state
pub struct HeapSampler {
    rate: AtomicI64,
    installed: AtomicBool,
    tracked: AtomicUsize,
    tables: Mutex<Option<Tables>>,
}

static HEAP: HeapSampler = HeapSampler::new();

/// The sampler behind the process's [`crate::alloc::SamplingAllocator`]
#[must_use]
pub fn heap_sampler() -> &'static HeapSampler {
    &HEAP
}

impl Default for HeapSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapSampler {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            rate: AtomicI64::new(0),
            installed: AtomicBool::new(false),
            tracked: AtomicUsize::new(0),
            tables: Mutex::new(None),
        }
    }

    /// Average bytes between samples; 0 or less stops sampling. Pointers
    /// already tracked keep being released as they are freed.
    pub fn set_rate(&self, rate: i64) {
        self.rate.store(rate.max(0), Ordering::Relaxed);
    }

    #[must_use]
    pub fn rate(&self) -> i64 {
        self.rate.load(Ordering::Relaxed)
    }

    /// Whether any allocation has gone through a sampling allocator
    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Relaxed)
    }

    /// Number of sampled allocations not yet freed
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.tracked.load(Ordering::Relaxed)
    }

    fn tables(&self) -> MutexGuard<'_, Option<Tables>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Account for a fresh allocation of `size` bytes at `ptr`
    pub fn on_alloc(&self, ptr: *mut u8, size: usize) {
        if !self.installed.load(Ordering::Relaxed) {
            self.installed.store(true, Ordering::Relaxed);
        }
        let rate = self.rate();
        if rate <= 0 || ptr.is_null() {
            return;
        }
        let Some(_guard) = ReentryGuard::enter() else {
            return;
        };
        if !countdown(size, rate) {
            return;
        }

        let stack = StackKey::capture();
        let size = u64::try_from(size).unwrap_or(u64::MAX);
        let mut tables = self.tables();
        let tables = tables.get_or_insert_with(Tables::default);

        let record = tables.stacks.entry(stack).or_default();
        record.alloc_objects += 1;
        record.alloc_bytes = record.alloc_bytes.saturating_add(size);
        record.inuse_objects += 1;
        record.inuse_bytes = record.inuse_bytes.saturating_add(size);

        if let Some((stale, stale_size)) = tables.live.insert(ptr as usize, (stack, size)) {
            // Address reused without a free we saw
            release(&mut tables.stacks, &stale, stale_size);
        } else {
            self.tracked.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Account for the release of `ptr`
    pub fn on_dealloc(&self, ptr: *mut u8) {
        if self.tracked.load(Ordering::Relaxed) == 0 {
            return;
        }
        let Some(_guard) = ReentryGuard::enter() else {
            return;
        };
        let mut tables = self.tables();
        let Some(tables) = tables.as_mut() else {
            return;
        };
        if let Some((stack, size)) = tables.live.remove(&(ptr as usize)) {
            self.tracked.fetch_sub(1, Ordering::Relaxed);
            release(&mut tables.stacks, &stack, size);
        }
    }

    /// Copy of the per-stack totals, leaf frame first
    #[must_use]
    pub fn records(&self) -> Vec<(Vec<usize>, HeapRecord)> {
        // Held (or already held by the caller) so the copy is not sampled
        let _guard = ReentryGuard::enter();
        let tables = self.tables();
        tables
            .as_ref()
            .map(|t| t.stacks.iter().map(|(stack, record)| (stack.ips().to_vec(), *record)).collect())
            .unwrap_or_default()
    }

    /// Encode the sampled heap as pprof protobuf
    ///
    /// # Errors
    /// Returns an error if writing fails
    pub fn write_pprof(&self, out: &mut dyn Write) -> Result<(), InstrumentationError> {
        let _guard = ReentryGuard::enter();
        let records = self.records();
        let profile = encode(&records, self.rate());
        out.write_all(&profile.encode_to_vec())?;
        Ok(())
    }
}

/// Advance this thread's countdown; true when the allocation is sampled
fn countdown(size: usize, rate: i64) -> bool {
    let size = i64::try_from(size).unwrap_or(i64::MAX);
    BYTES_UNTIL_SAMPLE
        .try_with(|left| {
            let remaining = left.get().min(rate).saturating_sub(size);
            if remaining <= 0 {
                left.set(rate);
                true
            } else {
                left.set(remaining);
                false
            }
        })
        .unwrap_or(false)
}

fn release(stacks: &mut HashMap<StackKey, HeapRecord>, stack: &StackKey, size: u64) {
    if let Some(record) = stacks.get_mut(stack) {
        record.inuse_objects = record.inuse_objects.saturating_sub(1);
        record.inuse_bytes = record.inuse_bytes.saturating_sub(size);
    }
}

/// Frames of the allocator and of the sampler itself, trimmed from the leaf
fn is_sampler_frame(name: &str) -> bool {
    const PREFIXES: &[&str] = &[
        "backtrace::",
        "_Unwind_",
        "snapprof::instrumentation::heap_sampler::",
        "snapprof::alloc::",
        "<snapprof::alloc::",
        "__rust_alloc",
        "__rust_realloc",
        "__rdl_",
        "alloc::alloc::",
    ];
    PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Interns strings, functions and locations into one pprof message
#[derive(Default)]
struct ProfileBuilder {
    strings: Vec<String>,
    string_ids: HashMap<String, i64>,
    functions: Vec<Function>,
    function_ids: HashMap<(String, Option<String>), u64>,
    locations: Vec<Location>,
    location_ids: HashMap<usize, (u64, bool)>,
}

impl ProfileBuilder {
    fn new() -> Self {
        let mut builder = Self::default();
        builder.string("");
        builder
    }

    fn string(&mut self, s: &str) -> i64 {
        if let Some(&id) = self.string_ids.get(s) {
            return id;
        }
        let id = saturating_i64(self.strings.len() as u64);
        self.strings.push(s.to_string());
        self.string_ids.insert(s.to_string(), id);
        id
    }

    fn value_type(&mut self, ty: &str, unit: &str) -> ValueType {
        ValueType { ty: self.string(ty), unit: self.string(unit) }
    }

    fn function(&mut self, frame: &ResolvedFrame) -> u64 {
        let key = (frame.name.clone(), frame.file.clone());
        if let Some(&id) = self.function_ids.get(&key) {
            return id;
        }
        let id = self.functions.len() as u64 + 1;
        let name = self.string(&frame.name);
        let filename = self.string(frame.file.as_deref().unwrap_or(""));
        self.functions.push(Function {
            id,
            name,
            system_name: name,
            filename,
            ..Default::default()
        });
        self.function_ids.insert(key, id);
        id
    }

    /// Location id for `ip`, and whether it belongs to the sampler
    fn location(&mut self, ip: usize) -> (u64, bool) {
        if let Some(&known) = self.location_ids.get(&ip) {
            return known;
        }
        let frames = resolve(ip);
        let internal = frames.iter().all(|frame| is_sampler_frame(&frame.name));
        let line = frames
            .iter()
            .map(|frame| Line {
                function_id: self.function(frame),
                line: frame.line.map_or(0, i64::from),
            })
            .collect();
        let id = self.locations.len() as u64 + 1;
        self.locations.push(Location { id, address: ip as u64, line, ..Default::default() });
        self.location_ids.insert(ip, (id, internal));
        (id, internal)
    }

    fn stack(&mut self, ips: &[usize]) -> Vec<u64> {
        let mut ids = Vec::with_capacity(ips.len());
        for &ip in ips {
            let (id, internal) = self.location(ip);
            if ids.is_empty() && internal {
                continue;
            }
            ids.push(id);
        }
        ids
    }
}

fn encode(records: &[(Vec<usize>, HeapRecord)], rate: i64) -> Profile {
    let mut builder = ProfileBuilder::new();
    let sample_type = vec![
        builder.value_type("alloc_objects", "count"),
        builder.value_type("alloc_space", "bytes"),
        builder.value_type("inuse_objects", "count"),
        builder.value_type("inuse_space", "bytes"),
    ];
    let period_type = builder.value_type("space", "bytes");
    let default_sample_type = builder.string("inuse_space");

    let sample = records
        .iter()
        .map(|(ips, record)| Sample {
            location_id: builder.stack(ips),
            value: vec![
                saturating_i64(record.alloc_objects),
                saturating_i64(record.alloc_bytes),
                saturating_i64(record.inuse_objects),
                saturating_i64(record.inuse_bytes),
            ],
            ..Default::default()
        })
        .collect();

    let time_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX));

    Profile {
        sample_type,
        sample,
        location: builder.locations,
        function: builder.functions,
        string_table: builder.strings,
        time_nanos,
        period_type: Some(period_type),
        period: rate,
        default_sample_type,
        ..Default::default()
    }
}
