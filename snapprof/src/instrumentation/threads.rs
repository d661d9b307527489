//! Thread dump
//!
//! Lists every thread of the current process by reading /proc filesystem.
//! At debug 2 every listed thread also gets its stack: the calling thread
//! unwinds itself, the others are interrupted one at a time with `SIGURG`
//! and unwind inside the signal handler. A thread that blocks the signal or
//! does not answer in time is reported without a stack.

use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

use super::symbols::resolve;
use crate::domain::{InstrumentationError, Tid};

/// How long to wait for one interrupted thread to publish its stack
pub const STACK_TIMEOUT: Duration = Duration::from_millis(100);

/// Deepest stack captured per thread
const MAX_FRAMES: usize = 64;

/// One live thread of the current process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub tid: Tid,
    pub comm: String,
    /// Scheduler state letter from `/proc/<tid>/stat` (R, S, D, ...)
    pub state: char,
}

/// List the threads of the current process via `/proc/self/task`
///
/// # Errors
/// Returns an error if the task directory cannot be read
#[cfg(target_os = "linux")]
pub fn list_threads() -> std::io::Result<Vec<ThreadInfo>> {
    use std::fs;

    let mut threads: Vec<ThreadInfo> = fs::read_dir("/proc/self/task")?
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let tid = entry.file_name().to_string_lossy().parse::<u32>().ok()?;

            let comm = fs::read_to_string(entry.path().join("comm")).ok()?;
            let stat = fs::read_to_string(entry.path().join("stat")).unwrap_or_default();

            Some(ThreadInfo {
                tid: Tid(tid),
                comm: comm.trim().to_string(),
                state: parse_stat_state(&stat).unwrap_or('?'),
            })
        })
        .collect();

    threads.sort_by_key(|t| t.tid);
    Ok(threads)
}

/// Without /proc only the calling thread is visible
///
/// # Errors
/// Never fails on this platform
#[cfg(not(target_os = "linux"))]
pub fn list_threads() -> std::io::Result<Vec<ThreadInfo>> {
    let current = std::thread::current();
    Ok(vec![ThreadInfo {
        tid: Tid(0),
        comm: current.name().unwrap_or("<unnamed>").to_string(),
        state: 'R',
    }])
}

/// TID of the calling thread, if the platform exposes it
#[cfg(target_os = "linux")]
#[must_use]
pub fn current_tid() -> Option<Tid> {
    // "/proc/thread-self" links to "<pid>/task/<tid>"
    let link = std::fs::read_link("/proc/thread-self").ok()?;
    let tid = link.file_name()?.to_str()?.parse::<u32>().ok()?;
    Some(Tid(tid))
}

/// The calling thread is the only one listed
#[cfg(not(target_os = "linux"))]
#[must_use]
pub fn current_tid() -> Option<Tid> {
    Some(Tid(0))
}

/// Extract the state letter from a `/proc/<pid>/stat` line.
///
/// The command name is wrapped in parentheses and may itself contain spaces
/// or parentheses, so the state is the first field after the last `)`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_stat_state(stat: &str) -> Option<char> {
    let (_, after_comm) = stat.rsplit_once(')')?;
    after_comm.split_whitespace().next()?.chars().next()
}

#[cfg(target_os = "linux")]
mod signal {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
    use std::sync::{Mutex, PoisonError};
    use std::time::{Duration, Instant};

    use super::MAX_FRAMES;
    use crate::domain::Tid;

    const CAPTURE_SIGNAL: libc::c_int = libc::SIGURG;
    const NO_TARGET: i32 = 0;
    const CLAIMED: i32 = -1;

    // One capture slot for the whole process. TARGET names the thread allowed
    // to fill it; the handler swaps it to CLAIMED before writing.
    static TARGET: AtomicI32 = AtomicI32::new(NO_TARGET);
    static DONE: AtomicBool = AtomicBool::new(false);
    static DEPTH: AtomicUsize = AtomicUsize::new(0);
    static FRAMES: [AtomicUsize; MAX_FRAMES] = [const { AtomicUsize::new(0) }; MAX_FRAMES];
    static DUMP_LOCK: Mutex<()> = Mutex::new(());

    #[allow(unsafe_code)]
    extern "C" fn capture_on_signal(_signal: libc::c_int) {
        // SAFETY: gettid takes no arguments and cannot fail
        let raw = unsafe { libc::syscall(libc::SYS_gettid) };
        let Ok(tid) = i32::try_from(raw) else {
            return;
        };
        if TARGET.compare_exchange(tid, CLAIMED, Ordering::AcqRel, Ordering::Relaxed).is_err() {
            return;
        }
        let mut depth = 0;
        // SAFETY: only the claimed thread gets here and it writes atomics only
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                FRAMES[depth].store(frame.ip() as usize, Ordering::Relaxed);
                depth += 1;
                depth < MAX_FRAMES
            });
        }
        DEPTH.store(depth, Ordering::Relaxed);
        DONE.store(true, Ordering::Release);
    }

    #[allow(unsafe_code)]
    fn install_handler() -> Option<libc::sigaction> {
        // SAFETY: a zeroed sigaction is a valid empty action; both structs
        // outlive the call
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction =
                capture_on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
            action.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);
            let mut previous: libc::sigaction = std::mem::zeroed();
            (libc::sigaction(CAPTURE_SIGNAL, &action, &mut previous) == 0).then_some(previous)
        }
    }

    #[allow(unsafe_code)]
    fn restore_handler(previous: &libc::sigaction) {
        // SAFETY: `previous` was filled in by sigaction
        unsafe {
            libc::sigaction(CAPTURE_SIGNAL, previous, std::ptr::null_mut());
        }
    }

    /// Wait for the handler to publish; false if the thread never picked up
    fn wait_for_capture(tid: i32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if DONE.load(Ordering::Acquire) {
                return true;
            }
            // A claimed slot is being written, so keep waiting for it
            if Instant::now() >= deadline
                && TARGET
                    .compare_exchange(tid, NO_TARGET, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                return false;
            }
            std::thread::yield_now();
        }
    }

    /// Interrupt each thread in `tids` and collect its raw stack
    #[allow(unsafe_code)]
    pub fn capture_stacks(tids: &[Tid], timeout: Duration) -> HashMap<Tid, Vec<usize>> {
        let _serial = DUMP_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stacks = HashMap::new();
        let Some(previous) = install_handler() else {
            return stacks;
        };
        // SAFETY: getpid cannot fail
        let pid = unsafe { libc::getpid() };

        for &tid in tids {
            let Ok(raw) = i32::try_from(tid.0) else {
                continue;
            };
            DONE.store(false, Ordering::Relaxed);
            DEPTH.store(0, Ordering::Relaxed);
            TARGET.store(raw, Ordering::Release);

            // SAFETY: tgkill only signals a thread of this process
            let sent =
                unsafe { libc::syscall(libc::SYS_tgkill, pid, raw, CAPTURE_SIGNAL) } == 0;
            if sent && wait_for_capture(raw, timeout) {
                let depth = DEPTH.load(Ordering::Acquire).min(MAX_FRAMES);
                let ips = FRAMES[..depth].iter().map(|ip| ip.load(Ordering::Relaxed)).collect();
                stacks.insert(tid, ips);
            }
            TARGET.store(NO_TARGET, Ordering::Release);
        }

        restore_handler(&previous);
        stacks
    }
}

#[inline(never)]
fn capture_current() -> Vec<usize> {
    let mut ips = Vec::new();
    backtrace::trace(|frame| {
        ips.push(frame.ip() as usize);
        ips.len() < MAX_FRAMES
    });
    ips
}

/// Raw stacks of the listed threads; threads that did not answer are absent
fn thread_stacks(threads: &[ThreadInfo], current: Option<Tid>) -> HashMap<Tid, Vec<usize>> {
    #[cfg(target_os = "linux")]
    let mut stacks = {
        let others: Vec<Tid> =
            threads.iter().map(|t| t.tid).filter(|tid| Some(*tid) != current).collect();
        signal::capture_stacks(&others, STACK_TIMEOUT)
    };
    #[cfg(not(target_os = "linux"))]
    let mut stacks = {
        let _ = threads;
        HashMap::new()
    };
    if let Some(tid) = current {
        stacks.insert(tid, capture_current());
    }
    stacks
}

/// Frames of the unwinder and the signal trampoline on top of every stack
fn is_unwinder_frame(name: &str) -> bool {
    name.starts_with("backtrace::")
        || name.starts_with("_Unwind_")
        || name.starts_with("__restore_rt")
        || name.contains("threads::signal::capture_on_signal")
        || name.contains("threads::capture_current")
}

fn write_stack(out: &mut dyn Write, ips: &[usize]) -> std::io::Result<()> {
    let mut leading = true;
    for &ip in ips {
        for frame in resolve(ip) {
            if leading && is_unwinder_frame(&frame.name) {
                continue;
            }
            leading = false;
            writeln!(out, "\t{}", frame.name)?;
            if let Some(file) = &frame.file {
                writeln!(out, "\t\t{file}:{}", frame.line.unwrap_or(0))?;
            }
        }
    }
    Ok(())
}

/// Write the text thread dump
///
/// Every level lists the threads; debug 2 and above append one stack
/// section per thread.
///
/// # Errors
/// Returns an error if the thread list cannot be read or writing fails
pub fn write_thread_dump(out: &mut dyn Write, debug: u8) -> Result<(), InstrumentationError> {
    let threads = list_threads()?;
    let current = current_tid();

    writeln!(out, "threads: {}", threads.len())?;
    writeln!(out)?;
    for thread in &threads {
        let marker = if Some(thread.tid) == current { " (current)" } else { "" };
        writeln!(out, "thread {} [{}] state={}{marker}", thread.tid, thread.comm, thread.state)?;
    }

    if debug >= 2 {
        let stacks = thread_stacks(&threads, current);
        for thread in &threads {
            let marker = if Some(thread.tid) == current { " (current)" } else { "" };
            writeln!(out)?;
            writeln!(out, "thread {} [{}] state={}{marker}:", thread.tid, thread.comm, thread.state)?;
            match stacks.get(&thread.tid) {
                Some(ips) => write_stack(out, ips)?,
                None => writeln!(out, "\t(stack unavailable)")?,
            }
        }
    }
    Ok(())
}
