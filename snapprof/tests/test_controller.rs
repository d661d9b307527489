use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use snapprof::instrumentation::CaptureSink;
use snapprof::{
    Config, Instrumentation, InstrumentationError, IntervalError, ProfileKind, ProfilerController,
    ProfilerError, RunOutcome, SnapshotError, UnixSeconds,
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    CpuRate(i32),
    StartCpu,
    StopCpu,
    MemoryRate(i64),
    BlockRate(i64),
    MutexFraction(i64),
    Write(ProfileKind, u8),
}

/// Backend that records every call and writes a marker instead of real data
#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<Call>>,
    cpu_sink: Mutex<Option<CaptureSink>>,
    failing: Option<ProfileKind>,
    cpu_start_fails: bool,
}

impl Recorder {
    fn failing(kind: ProfileKind) -> Self {
        Self { failing: Some(kind), ..Self::default() }
    }

    fn cpu_start_failing() -> Self {
        Self { cpu_start_fails: true, ..Self::default() }
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn push(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Instrumentation for Recorder {
    fn set_cpu_profile_rate(&self, hz: i32) -> Result<(), InstrumentationError> {
        self.push(Call::CpuRate(hz));
        Ok(())
    }

    fn start_cpu_profile(&self, sink: CaptureSink) -> Result<(), InstrumentationError> {
        self.push(Call::StartCpu);
        if self.cpu_start_fails {
            return Err(InstrumentationError::CpuAlreadyRunning);
        }
        *self.cpu_sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn stop_cpu_profile(&self) -> Result<(), InstrumentationError> {
        self.push(Call::StopCpu);
        if let Some(mut sink) = self.cpu_sink.lock().unwrap().take() {
            sink.write_all(b"cpu capture")?;
            sink.flush()?;
        }
        Ok(())
    }

    fn set_memory_profile_rate(&self, rate: i64) -> Result<(), InstrumentationError> {
        self.push(Call::MemoryRate(rate));
        Ok(())
    }

    fn set_block_profile_rate(&self, rate: i64) -> Result<(), InstrumentationError> {
        self.push(Call::BlockRate(rate));
        Ok(())
    }

    fn set_mutex_profile_fraction(&self, fraction: i64) -> Result<(), InstrumentationError> {
        self.push(Call::MutexFraction(fraction));
        Ok(())
    }

    fn write_profile(
        &self,
        kind: ProfileKind,
        out: &mut dyn Write,
        debug: u8,
    ) -> Result<(), InstrumentationError> {
        self.push(Call::Write(kind, debug));
        if self.failing == Some(kind) {
            return Err(InstrumentationError::Unsupported(kind));
        }
        write!(out, "{kind} debug={debug}")?;
        Ok(())
    }
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Clock advancing one second per reading so artifact names never collide
fn ticking_clock() -> impl Fn() -> UnixSeconds + Send + Sync + 'static {
    let now = AtomicU64::new(1_000);
    move || UnixSeconds(now.fetch_add(1, Ordering::SeqCst))
}

fn controller(config: Config, backend: &Arc<Recorder>) -> ProfilerController {
    let backend: Arc<dyn Instrumentation> = Arc::clone(backend) as Arc<dyn Instrumentation>;
    ProfilerController::with_instrumentation(config, backend).with_clock(ticking_clock())
}

fn prefix_in(dir: &Path) -> String {
    format!("{}/t.", dir.display())
}

/// Artifact file names in `dir`, sorted
fn artifacts(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn count_kind(names: &[String], label: &str) -> usize {
    let prefix = format!("t.{label}.");
    names.iter().filter(|n| n.starts_with(&prefix) && n.ends_with(".pprof")).count()
}

#[test]
fn test_no_kinds_enabled_returns_immediately() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(Recorder::default());
    let config = Config { prefix: prefix_in(dir.path()), interval: "50ms".into(), ..Config::default() };

    let started = Instant::now();
    let outcome = controller(config, &backend).run().unwrap();

    assert_eq!(outcome, RunOutcome::Activated);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(artifacts(dir.path()).is_empty());
    assert!(backend.calls().is_empty());
}

#[test]
fn test_single_shot_writes_one_artifact_on_demand() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(Recorder::default());
    let config = Config {
        memory: true,
        memory_profile_rate: 4096,
        prefix: prefix_in(dir.path()),
        ..Config::default()
    };
    let controller = controller(config, &backend);

    assert_eq!(controller.run().unwrap(), RunOutcome::Activated);
    assert!(artifacts(dir.path()).is_empty());

    let report = controller.take_snapshot();
    assert!(report.is_complete());
    let written: Vec<PathBuf> = report.written().map(Path::to_path_buf).collect();
    assert_eq!(written.len(), 1);
    assert_eq!(std::fs::read_to_string(&written[0]).unwrap(), "mem debug=0");

    let names = artifacts(dir.path());
    assert_eq!(names.len(), 1);
    assert_eq!(count_kind(&names, "mem"), 1);
    assert_eq!(backend.calls(), [Call::MemoryRate(4096), Call::Write(ProfileKind::Memory, 0)]);
}

#[test]
fn test_stop_before_first_tick_takes_final_snapshot() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(Recorder::default());
    let config = Config {
        cpu: true,
        memory: true,
        prefix: prefix_in(dir.path()),
        interval: "50ms".into(),
        ..Config::default()
    };
    let controller = controller(config, &backend);

    controller.stop();
    let outcome = controller.run().unwrap();

    // One snapshot means the termination path won before the first tick
    assert_eq!(outcome, RunOutcome::Stopped { snapshots: 1 });

    let names = artifacts(dir.path());
    assert_eq!(names.len(), 2, "{names:?}");
    assert_eq!(count_kind(&names, "cpu"), 1);
    assert_eq!(count_kind(&names, "mem"), 1);
    assert_eq!(controller.pending_cleanups(), 0);

    let cpu = dir.path().join(names.iter().find(|n| n.starts_with("t.cpu.")).unwrap());
    assert_eq!(std::fs::read_to_string(cpu).unwrap(), "cpu capture");
}

#[test]
fn test_stop_unblocks_long_interval() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(Recorder::default());
    let config = Config {
        goroutine: true,
        prefix: prefix_in(dir.path()),
        interval: "1h".into(),
        ..Config::default()
    };
    let controller = Arc::new(controller(config, &backend));

    let runner = Arc::clone(&controller);
    let handle = std::thread::spawn(move || runner.run());
    std::thread::sleep(Duration::from_millis(50));

    let stopped_at = Instant::now();
    controller.stop();
    let outcome = handle.join().unwrap().unwrap();

    assert!(stopped_at.elapsed() < Duration::from_secs(5));
    assert_eq!(outcome, RunOutcome::Stopped { snapshots: 1 });
    assert_eq!(count_kind(&artifacts(dir.path()), "goroutine"), 1);
}

#[test]
fn test_repeated_snapshots_write_fresh_artifacts() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(Recorder::default());
    let config = Config {
        goroutine: true,
        mutex: true,
        mutex_profile_fraction: 5,
        prefix: prefix_in(dir.path()),
        ..Config::default()
    };
    let controller = controller(config, &backend);
    controller.run().unwrap();

    for _ in 0..3 {
        let report = controller.take_snapshot();
        assert_eq!(report.written().count(), 2);
    }

    let names = artifacts(dir.path());
    assert_eq!(count_kind(&names, "goroutine"), 3);
    assert_eq!(count_kind(&names, "mutex"), 3);
}

#[test]
fn test_snapshot_artifacts_share_timestamp() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(Recorder::default());
    let config = Config {
        memory: true,
        block: true,
        goroutine: true,
        prefix: prefix_in(dir.path()),
        ..Config::default()
    };
    let controller = controller(config, &backend);

    let report = controller.take_snapshot();
    let kinds: Vec<ProfileKind> = report.artifacts.iter().map(|a| a.kind()).collect();
    assert_eq!(kinds, [ProfileKind::Memory, ProfileKind::Block, ProfileKind::Goroutine]);

    let stamp = format!(".{}.pprof", report.taken_at);
    assert!(report.written().all(|p| p.to_string_lossy().ends_with(&stamp)));
}

#[test]
fn test_cleanups_cleared_after_snapshot() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(Recorder::default());
    let config = Config { cpu: true, prefix: prefix_in(dir.path()), ..Config::default() };
    let controller = controller(config, &backend);

    controller.run().unwrap();
    assert_eq!(controller.pending_cleanups(), 1);

    let first = controller.take_snapshot();
    assert_eq!(first.cleanups_run, 1);
    assert_eq!(first.written().count(), 1);
    assert_eq!(controller.pending_cleanups(), 0);

    // Nothing re-activated the capture, so there is nothing left to close
    let second = controller.take_snapshot();
    assert_eq!(second.cleanups_run, 0);
    assert!(second.artifacts.is_empty());
}

#[test]
fn test_invalid_interval_keeps_activation() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(Recorder::default());
    let config = Config {
        memory: true,
        memory_profile_rate: 1,
        prefix: prefix_in(dir.path()),
        interval: "banana".into(),
        ..Config::default()
    };

    let result = controller(config, &backend).run();

    assert!(matches!(
        result,
        Err(ProfilerError::InvalidInterval(IntervalError::Malformed(ref s))) if s == "banana"
    ));
    assert_eq!(backend.calls(), [Call::MemoryRate(1)]);
    assert!(artifacts(dir.path()).is_empty());
}

#[test]
fn test_cpu_interval_loop_rotates_artifacts() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(Recorder::default());
    let config = Config {
        cpu: true,
        prefix: prefix_in(dir.path()),
        interval: "100ms".into(),
        ..Config::default()
    };
    let controller = Arc::new(controller(config, &backend));

    let runner = Arc::clone(&controller);
    let handle = std::thread::spawn(move || runner.run());
    std::thread::sleep(Duration::from_millis(250));
    controller.stop();
    let outcome = handle.join().unwrap().unwrap();

    let RunOutcome::Stopped { snapshots } = outcome else {
        panic!("loop did not stop: {outcome:?}");
    };
    assert!(snapshots >= 2, "only {snapshots} snapshots");

    let names = artifacts(dir.path());
    assert!(count_kind(&names, "cpu") >= 2, "{names:?}");
    assert_eq!(count_kind(&names, "cpu"), names.len());
    assert_eq!(controller.pending_cleanups(), 0);

    let calls = backend.calls();
    let starts = calls.iter().filter(|c| **c == Call::StartCpu).count();
    let stops = calls.iter().filter(|c| **c == Call::StopCpu).count();
    assert_eq!(starts, stops);
}

#[test]
fn test_failed_kind_does_not_stop_others() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(Recorder::failing(ProfileKind::Memory));
    let config = Config {
        memory: true,
        goroutine: true,
        prefix: prefix_in(dir.path()),
        ..Config::default()
    };
    let controller = controller(config, &backend);

    let report = controller.take_snapshot();

    assert!(!report.is_complete());
    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, ProfileKind::Memory);
    assert!(matches!(failures[0].1, SnapshotError::Write { kind: ProfileKind::Memory, .. }));

    let written: Vec<_> = report.written().collect();
    assert_eq!(written.len(), 1);
    assert!(written[0].to_string_lossy().contains("t.goroutine."));
}

#[test]
fn test_uncreatable_artifact_is_reported() {
    let backend = Arc::new(Recorder::default());
    let config = Config {
        mutex: true,
        prefix: "/nonexistent-snapprof-dir/t.".into(),
        ..Config::default()
    };

    let report = controller(config, &backend).take_snapshot();

    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert!(matches!(failures[0].1, SnapshotError::Create { .. }));
    assert!(backend.calls().iter().all(|c| !matches!(c, Call::Write(..))));
}

#[test]
fn test_cpu_artifact_failure_aborts_activation() {
    init_logging();
    let backend = Arc::new(Recorder::default());
    let config = Config {
        cpu: true,
        memory: true,
        prefix: "/nonexistent-snapprof-dir/t.".into(),
        interval: "10ms".into(),
        ..Config::default()
    };
    let controller = controller(config, &backend);

    let result = controller.run();

    assert!(matches!(result, Err(ProfilerError::CpuArtifact { .. })));
    assert!(backend.calls().is_empty());
    assert_eq!(controller.pending_cleanups(), 0);
}

#[test]
fn test_cpu_rate_applied_only_when_positive() {
    let dir = tempfile::tempdir().unwrap();

    let backend = Arc::new(Recorder::default());
    let config = Config {
        cpu: true,
        cpu_profile_rate: 250,
        prefix: prefix_in(dir.path()),
        ..Config::default()
    };
    let first = controller(config, &backend);
    first.run().unwrap();
    assert_eq!(backend.calls(), [Call::CpuRate(250), Call::StartCpu]);

    let backend = Arc::new(Recorder::default());
    let config = Config {
        cpu: true,
        cpu_profile_rate: -3,
        prefix: prefix_in(dir.path()),
        ..Config::default()
    };
    let second = controller(config, &backend);
    second.run().unwrap();
    assert_eq!(backend.calls(), [Call::StartCpu]);
}

#[test]
fn test_block_rate_reset_after_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(Recorder::default());
    let config = Config {
        block: true,
        mutex: true,
        mutex_profile_fraction: 3,
        prefix: prefix_in(dir.path()),
        ..Config::default()
    };
    let controller = controller(config, &backend);

    controller.run().unwrap();
    controller.take_snapshot();

    assert_eq!(
        backend.calls(),
        [
            Call::BlockRate(1),
            Call::MutexFraction(3),
            Call::Write(ProfileKind::Block, 2),
            Call::BlockRate(0),
            Call::Write(ProfileKind::Mutex, 2),
        ]
    );
}

#[test]
fn test_concurrent_snapshots_run_each_cleanup_once() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(Recorder::default());
    let config = Config { goroutine: true, prefix: prefix_in(dir.path()), ..Config::default() };
    let controller = Arc::new(controller(config, &backend));

    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..16 {
        let ran = Arc::clone(&ran);
        controller.defer_cleanup(move || {
            ran.fetch_add(1, Ordering::SeqCst);
        });
    }

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let controller = Arc::clone(&controller);
            std::thread::spawn(move || controller.take_snapshot().cleanups_run)
        })
        .collect();
    let reported: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

    assert_eq!(reported, 16);
    assert_eq!(ran.load(Ordering::SeqCst), 16);
    assert_eq!(controller.pending_cleanups(), 0);
}

#[test]
fn test_dropping_controller_closes_cpu_capture() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(Recorder::default());
    let config = Config { cpu: true, prefix: prefix_in(dir.path()), ..Config::default() };

    let controller = controller(config, &backend);
    controller.run().unwrap();
    assert_eq!(controller.pending_cleanups(), 1);
    drop(controller);

    let names = artifacts(dir.path());
    assert_eq!(count_kind(&names, "cpu"), 1);
    assert_eq!(std::fs::read_to_string(dir.path().join(&names[0])).unwrap(), "cpu capture");
    assert_eq!(backend.calls(), [Call::StartCpu, Call::StopCpu]);
}

#[test]
fn test_cpu_start_failure_is_reported() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(Recorder::cpu_start_failing());
    let config = Config { cpu: true, prefix: prefix_in(dir.path()), ..Config::default() };
    let controller = controller(config, &backend);

    assert_eq!(controller.run().unwrap(), RunOutcome::Activated);
    let report = controller.take_snapshot();

    assert!(!report.is_complete());
    assert_eq!(report.written().count(), 0);
    let failures: Vec<_> = report.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, ProfileKind::Cpu);
    assert!(matches!(
        failures[0].1,
        SnapshotError::Write { kind: ProfileKind::Cpu, source: InstrumentationError::CpuAlreadyRunning }
    ));
    // The file is still closed by its cleanup
    assert_eq!(report.cleanups_run, 1);
    assert_eq!(controller.pending_cleanups(), 0);
}

#[test]
fn test_cleanup_may_defer_another_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(Recorder::default());
    let config = Config { goroutine: true, prefix: prefix_in(dir.path()), ..Config::default() };
    let controller = Arc::new(controller(config, &backend));

    let weak = Arc::downgrade(&controller);
    controller.defer_cleanup(move || {
        if let Some(controller) = weak.upgrade() {
            controller.defer_cleanup(|| {});
        }
    });

    let report = controller.take_snapshot();
    assert_eq!(report.cleanups_run, 1);
    assert_eq!(controller.pending_cleanups(), 1);
}

#[test]
fn test_drop_runs_pending_cleanups() {
    let backend = Arc::new(Recorder::default());
    let controller = controller(Config::default(), &backend);

    let ran = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ran);
    controller.defer_cleanup(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    drop(controller);
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert!(backend.calls().is_empty());
}

#[test]
fn test_block_loop_reactivates_after_each_tick() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(Recorder::default());
    let config = Config {
        block: true,
        prefix: prefix_in(dir.path()),
        interval: "100ms".into(),
        ..Config::default()
    };
    let controller = Arc::new(controller(config, &backend));

    let runner = Arc::clone(&controller);
    let handle = std::thread::spawn(move || runner.run());
    std::thread::sleep(Duration::from_millis(250));
    controller.stop();
    let outcome = handle.join().unwrap().unwrap();

    let RunOutcome::Stopped { snapshots } = outcome else {
        panic!("loop did not stop: {outcome:?}");
    };
    assert!(snapshots >= 2, "only {snapshots} snapshots");

    let calls = backend.calls();
    assert_eq!(
        calls[..5],
        [
            Call::BlockRate(1),
            Call::Write(ProfileKind::Block, 2),
            Call::BlockRate(0),
            Call::BlockRate(1),
            Call::Write(ProfileKind::Block, 2),
        ]
    );
    assert_eq!(calls.last(), Some(&Call::BlockRate(0)));
    // Every snapshot switched recording off and every tick switched it back on
    let on = calls.iter().filter(|c| **c == Call::BlockRate(1)).count();
    let off = calls.iter().filter(|c| **c == Call::BlockRate(0)).count();
    assert_eq!(off, snapshots);
    assert_eq!(on, snapshots);
    assert_eq!(count_kind(&artifacts(dir.path()), "block"), snapshots);
}
