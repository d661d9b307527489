//! Artifact naming

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::domain::{ProfileKind, UnixSeconds};

/// `<prefix><kind>.<unix-seconds>.pprof`
///
/// The prefix is used verbatim: `"/tmp/app."` yields `/tmp/app.cpu.1700000000.pprof`,
/// `"/tmp/app/"` puts the artifacts inside the (existing) directory.
#[must_use]
pub fn artifact_path(prefix: &str, kind: ProfileKind, at: UnixSeconds) -> PathBuf {
    PathBuf::from(format!("{prefix}{}.{at}.pprof", kind.label()))
}

/// Current wall-clock time at second resolution
#[must_use]
pub fn system_now() -> UnixSeconds {
    UnixSeconds(SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs()))
}
