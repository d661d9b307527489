//! Single-shot use of the profiler: activate, do some work, snapshot once
//!
//! ```bash
//! RUST_LOG=info cargo run --example walkthrough -- /tmp/walkthrough.
//! ```

use std::sync::Arc;
use std::time::Duration;

use snapprof::sync::{measure_blocking, Mutex};
use snapprof::{Config, ProfilerController, RunOutcome};

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let prefix = std::env::args().nth(1).unwrap_or_else(|| "walkthrough.".to_string());
    let config = Config {
        cpu: true,
        block: true,
        goroutine: true,
        mutex: true,
        mutex_profile_fraction: 1,
        prefix,
        ..Config::default()
    };

    // No interval: run() only activates and hands snapshots back to us
    let controller = ProfilerController::new(config);
    assert_eq!(controller.run()?, RunOutcome::Activated);

    let shared = Arc::new(Mutex::new(Vec::new()));
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || {
                for n in 0..200_u64 {
                    if let Ok(mut values) = shared.lock() {
                        values.push(n * i);
                        std::thread::sleep(Duration::from_micros(200));
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        measure_blocking(|| handle.join()).ok();
    }

    let report = controller.take_snapshot();
    for path in report.written() {
        println!("saved: {}", path.display());
    }
    for (kind, error) in report.failures() {
        eprintln!("skipped {kind}: {error}");
    }

    // Nothing is looping; stop() only marks the controller as finished
    controller.stop();
    Ok(())
}
