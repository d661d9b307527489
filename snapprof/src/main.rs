//! # snapprof - Main Entry Point
//!
//! Runs a synthetic workload that exercises every profile kind and drives a
//! [`ProfilerController`] over it:
//! - **Interval mode** (`--interval 10s`): snapshots every tick, a final one on exit
//! - **Single-shot mode** (no interval): one snapshot when the run ends
//!
//! The run ends on Ctrl+C or after `--duration` seconds.

// Workload sizes are small; truncating the mixing state is intended
#![allow(clippy::cast_possible_truncation)]

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use snapprof::cli::Args;
use snapprof::sync::{measure_blocking, Mutex};
use snapprof::{ProfilerController, RunOutcome};

#[cfg(not(feature = "jemalloc"))]
#[global_allocator]
static GLOBAL: snapprof::alloc::SamplingAllocator = snapprof::alloc::SamplingAllocator::system();

#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

// Heap sampling needs jemalloc's profiler compiled in and switched on at startup
#[cfg(feature = "jemalloc")]
#[allow(non_upper_case_globals, unsafe_code)]
#[export_name = "malloc_conf"]
pub static malloc_conf: &[u8] = b"prof:true,prof_active:true,lg_prof_sample:19\0";

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = format!("{err:#}").to_lowercase();
    if msg.contains("permission denied") {
        EXIT_NOPERM
    } else if msg.contains("interval") || msg.contains("config file") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

/// State shared by the synthetic workload threads
struct Workload {
    running: AtomicBool,
    counter: Mutex<u64>,
}

impl Workload {
    fn spawn(workers: usize) -> Result<(Arc<Self>, Vec<JoinHandle<()>>)> {
        let workload = Arc::new(Self { running: AtomicBool::new(true), counter: Mutex::new(0) });
        let handles = (0..workers)
            .map(|i| {
                let workload = Arc::clone(&workload);
                std::thread::Builder::new()
                    .name(format!("snapprof-worker-{i}"))
                    .spawn(move || workload.work())
                    .context("Failed to spawn workload thread")
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((workload, handles))
    }

    fn work(&self) {
        let (_tx, rx) = crossbeam_channel::bounded::<()>(0);
        let mut retained: Vec<Vec<u8>> = Vec::new();
        let mut seed = 0x9e37_79b9_7f4a_7c15_u64;

        while self.running.load(Ordering::Relaxed) {
            // CPU: a few milliseconds of integer mixing
            let burn_until = Instant::now() + Duration::from_millis(5);
            while Instant::now() < burn_until {
                seed ^= seed << 13;
                seed ^= seed >> 7;
                seed ^= seed << 17;
            }

            // Heap: keep a sliding window of live buffers
            retained.push(vec![0u8; 64 * 1024 + (seed % 4096) as usize]);
            if retained.len() > 32 {
                retained.remove(0);
            }

            // Mutex: hold the shared lock long enough for others to queue up
            if let Ok(mut counter) = self.counter.lock() {
                *counter = counter.wrapping_add(seed & 0xff);
                std::thread::sleep(Duration::from_micros(500));
            }

            // Block: a receive that always times out
            let _ = measure_blocking(|| rx.recv_timeout(Duration::from_millis(2)));
        }
        debug!("workload thread done, retained {} buffers", retained.len());
    }

    fn stop(&self, handles: Vec<JoinHandle<()>>) {
        self.running.store(false, Ordering::Relaxed);
        for handle in handles {
            handle.join().ok();
        }
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();
    let quiet = args.quiet;

    let config = args.to_config().context("Failed to load config file")?;
    let interval = config.parse_interval().context("Invalid --interval")?;
    // Only the looping controller keeps its thread alive until stop()
    let looping = config.is_on() && interval.is_some();
    if let Some(interval) = interval {
        info!("Snapshot interval: {interval:?}");
    }

    if !quiet {
        println!("snapprof v{}", env!("CARGO_PKG_VERSION"));
        let kinds: Vec<_> = config.enabled_kinds().map(|k| k.label()).collect();
        println!("kinds: {}", if kinds.is_empty() { "none".to_string() } else { kinds.join(",") });
        println!("prefix: {:?}", config.prefix);
        println!("workers: {}", args.workers);
    }

    let (workload, workers) = Workload::spawn(args.workers)?;

    let controller = Arc::new(ProfilerController::new(config));
    let runner = Arc::clone(&controller);
    let run_handle = std::thread::Builder::new()
        .name("snapprof-run".to_string())
        .spawn(move || runner.run())
        .context("Failed to spawn profiler thread")?;

    let started = Instant::now();
    let duration_limit = (args.duration > 0).then_some(Duration::from_secs(args.duration));

    // Setup Ctrl+C handler
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let exit_reason = loop {
        if looping && run_handle.is_finished() {
            break "profiler exited";
        }
        if let Some(limit) = duration_limit {
            if started.elapsed() >= limit {
                break "duration limit reached";
            }
        }

        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(100)) => {}
            _ = &mut ctrl_c => break "interrupted",
        }
    };

    controller.stop();
    let outcome = run_handle
        .join()
        .map_err(|_| anyhow::anyhow!("profiler thread panicked"))?
        .context("Profiler failed")?;

    // Single-shot mode: the snapshot is ours to take, while the workload still runs.
    // Heap dumps take a blocking lock, so stay off the async worker.
    let report = if outcome == RunOutcome::Activated {
        let controller = Arc::clone(&controller);
        let report = tokio::task::spawn_blocking(move || controller.take_snapshot())
            .await
            .context("snapshot task failed")?;
        Some(report)
    } else {
        None
    };
    workload.stop(workers);

    if !quiet {
        eprintln!("\n{exit_reason}: {:.1}s", started.elapsed().as_secs_f64());
        match (outcome, &report) {
            (RunOutcome::Stopped { snapshots }, _) => println!("snapshots: {snapshots}"),
            (RunOutcome::Activated, Some(report)) => {
                for path in report.written() {
                    println!("saved: {}", path.display());
                }
                for (kind, error) in report.failures() {
                    eprintln!("skipped {kind}: {error}");
                }
            }
            (RunOutcome::Activated, None) => {}
        }
    }

    Ok(())
}
