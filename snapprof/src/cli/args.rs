//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

use crate::config::Config;
use crate::domain::ConfigError;

#[derive(Parser, Debug)]
#[command(
    name = "snapprof",
    about = "Run a synthetic workload under the snapshot profiler",
    after_help = "\
EXAMPLES:
    snapprof --cpu --memory --interval 10s           Snapshot every 10 seconds until Ctrl+C
    snapprof --config profiler.json --duration 60    Settings from a JSON file, stop after 60s
    snapprof --block --mutex --prefix /tmp/app.      Single snapshot at exit"
)]
pub struct Args {
    /// JSON config file; the flags below override its fields
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable CPU profiling
    #[arg(long)]
    pub cpu: bool,

    /// Enable heap allocation profiling
    #[arg(long)]
    pub memory: bool,

    /// Enable blocking-event profiling
    #[arg(long)]
    pub block: bool,

    /// Capture a thread dump on every snapshot
    #[arg(long)]
    pub goroutine: bool,

    /// Enable contended mutex profiling
    #[arg(long)]
    pub mutex: bool,

    /// Prefix for artifact names (e.g. /tmp/app.)
    #[arg(long)]
    pub prefix: Option<String>,

    /// Snapshot interval such as 30s or 1m30s (empty = single snapshot at exit)
    #[arg(short, long)]
    pub interval: Option<String>,

    /// Average bytes between sampled allocations
    #[arg(long, value_name = "BYTES")]
    pub memory_profile_rate: Option<i64>,

    /// CPU samples per second
    #[arg(long, value_name = "HZ")]
    pub cpu_profile_rate: Option<i32>,

    /// Record one in N contention events
    #[arg(long, value_name = "N")]
    pub mutex_profile_fraction: Option<i64>,

    /// Stop after N seconds (0 = until Ctrl+C)
    #[arg(long, default_value = "0")]
    pub duration: u64,

    /// Number of synthetic workload threads
    #[arg(short, long, default_value = "4")]
    pub workers: usize,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Build the profiler config: the file (if any), then the flags on top
    ///
    /// # Errors
    /// Returns an error if the config file cannot be read or parsed
    pub fn to_config(&self) -> Result<Config, ConfigError> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        config.cpu |= self.cpu;
        config.memory |= self.memory;
        config.block |= self.block;
        config.goroutine |= self.goroutine;
        config.mutex |= self.mutex;

        if let Some(prefix) = &self.prefix {
            config.prefix.clone_from(prefix);
        }
        if let Some(interval) = &self.interval {
            config.interval.clone_from(interval);
        }
        if let Some(rate) = self.memory_profile_rate {
            config.memory_profile_rate = rate;
        }
        if let Some(rate) = self.cpu_profile_rate {
            config.cpu_profile_rate = rate;
        }
        if let Some(fraction) = self.mutex_profile_fraction {
            config.mutex_profile_fraction = fraction;
        }
        Ok(config)
    }
}
