#![cfg(not(feature = "jemalloc"))]

use pprof::protos::{Message, Profile};
use snapprof::alloc::SamplingAllocator;
use snapprof::{Config, ProfileKind, ProfilerController, RunOutcome};

#[global_allocator]
static GLOBAL: SamplingAllocator = SamplingAllocator::system();

#[inline(never)]
fn retain_buffers() -> Vec<Vec<u8>> {
    (0..16).map(|i| vec![i as u8; 64 * 1024]).collect()
}

#[test]
fn test_memory_snapshot_with_sampling_allocator() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        memory: true,
        memory_profile_rate: 1,
        prefix: format!("{}/heap.", dir.path().display()),
        ..Config::default()
    };
    let controller = ProfilerController::new(config);
    assert_eq!(controller.run().unwrap(), RunOutcome::Activated);

    let buffers = std::hint::black_box(retain_buffers());

    let report = controller.take_snapshot();
    assert!(report.is_complete(), "{:?}", report.failures().collect::<Vec<_>>());
    assert_eq!(report.artifacts.len(), 1);
    assert_eq!(report.artifacts[0].kind(), ProfileKind::Memory);

    let bytes = std::fs::read(report.artifacts[0].path()).unwrap();
    let profile = Profile::decode(bytes.as_slice()).unwrap();
    assert!(!profile.sample.is_empty());
    assert_eq!(profile.period, 1);

    // inuse_space is the fourth value; the retained buffers alone hold 1 MiB
    let inuse: i64 = profile.sample.iter().map(|s| s.value[3]).sum();
    assert!(inuse >= 16 * 64 * 1024, "inuse_space {inuse}");
    assert!(
        profile.string_table.iter().any(|s| s.contains("retain_buffers")),
        "allocation site not symbolized"
    );

    drop(buffers);
}
