//! Snapshot writing
//!
//! One snapshot writes one artifact per enabled kind, in kind order, then
//! runs the cleanups that became due. A failed artifact is logged and
//! reported; it never stops the other kinds.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use log::{info, warn};

use super::{apply_knob, lock, CpuArtifact, ProfilerController};
use crate::controller::artifact::artifact_path;
use crate::domain::{ProfileKind, SnapshotError, UnixSeconds};

/// What happened to one kind during a snapshot
#[derive(Debug)]
pub enum ArtifactOutcome {
    /// The artifact at `path` is complete
    Written { kind: ProfileKind, path: PathBuf },
    /// The kind was skipped; `path` may exist but be incomplete
    Failed { kind: ProfileKind, path: PathBuf, error: SnapshotError },
}

impl ArtifactOutcome {
    #[must_use]
    pub const fn kind(&self) -> ProfileKind {
        match self {
            ArtifactOutcome::Written { kind, .. } | ArtifactOutcome::Failed { kind, .. } => *kind,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            ArtifactOutcome::Written { path, .. } | ArtifactOutcome::Failed { path, .. } => path,
        }
    }

    #[must_use]
    pub const fn is_written(&self) -> bool {
        matches!(self, ArtifactOutcome::Written { .. })
    }
}

/// Result of one [`ProfilerController::take_snapshot`] call
#[derive(Debug)]
pub struct SnapshotReport {
    /// Timestamp shared by every artifact named in this snapshot
    pub taken_at: UnixSeconds,
    pub artifacts: Vec<ArtifactOutcome>,
    /// Number of cleanup actions that ran at the end of the snapshot
    pub cleanups_run: usize,
}

impl SnapshotReport {
    /// Paths of the complete artifacts
    pub fn written(&self) -> impl Iterator<Item = &Path> + '_ {
        self.artifacts.iter().filter(|a| a.is_written()).map(ArtifactOutcome::path)
    }

    /// Kinds that were skipped, with the reason
    pub fn failures(&self) -> impl Iterator<Item = (ProfileKind, &SnapshotError)> + '_ {
        self.artifacts.iter().filter_map(|a| match a {
            ArtifactOutcome::Failed { kind, error, .. } => Some((*kind, error)),
            ArtifactOutcome::Written { .. } => None,
        })
    }

    /// True when no kind failed
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures().next().is_none()
    }
}

impl ProfilerController {
    /// Take a profiling snapshot of every enabled kind
    ///
    /// Writes one artifact per enabled kind, then runs every pending cleanup
    /// in registration order and clears the list. Safe to call at any time
    /// and from any thread, including while [`ProfilerController::run`] is
    /// waiting; concurrent snapshots are not serialized against each other.
    pub fn take_snapshot(&self) -> SnapshotReport {
        let taken_at = self.now();
        let mut artifacts = Vec::new();

        for kind in self.config.enabled_kinds() {
            let outcome = match kind {
                ProfileKind::Cpu => self.take_cpu_snapshot(),
                ProfileKind::Memory | ProfileKind::Goroutine | ProfileKind::Mutex => {
                    Some(self.dump(kind, taken_at))
                }
                ProfileKind::Block => {
                    let outcome = self.dump(kind, taken_at);
                    apply_knob(
                        "disable block profiling",
                        self.instrumentation.set_block_profile_rate(0),
                    );
                    Some(outcome)
                }
            };
            artifacts.extend(outcome);
        }

        let cleanups_run = self.run_cleanups();
        SnapshotReport { taken_at, artifacts, cleanups_run }
    }

    /// Stop the continuous CPU capture; its file is closed by the cleanup
    /// registered at activation
    fn take_cpu_snapshot(&self) -> Option<ArtifactOutcome> {
        info!("Stopping CPU Profiler");
        let stopped = self.instrumentation.stop_cpu_profile();
        let Some(CpuArtifact { path, start_error }) = lock(&self.cpu_artifact).take() else {
            if let Err(e) = stopped {
                warn!("could not stop CPU profile: {e}");
            }
            return None;
        };

        // A capture that never started left nothing but an empty file
        let captured = match start_error {
            Some(e) => {
                if let Err(stop) = stopped {
                    warn!("could not stop CPU profile: {stop}");
                }
                Err(e)
            }
            None => stopped,
        };
        Some(match captured {
            Ok(()) => ArtifactOutcome::Written { kind: ProfileKind::Cpu, path },
            Err(source) => {
                let error = SnapshotError::Write { kind: ProfileKind::Cpu, source };
                warn!("{error}");
                ArtifactOutcome::Failed { kind: ProfileKind::Cpu, path, error }
            }
        })
    }

    fn dump(&self, kind: ProfileKind, taken_at: UnixSeconds) -> ArtifactOutcome {
        let path = artifact_path(&self.config.prefix, kind, taken_at);
        info!("Taking {} Profile Snapshot: {}", title(kind), path.display());

        match self.write_artifact(kind, &path) {
            Ok(()) => ArtifactOutcome::Written { kind, path },
            Err(error) => {
                warn!("{error}");
                ArtifactOutcome::Failed { kind, path, error }
            }
        }
    }

    fn write_artifact(&self, kind: ProfileKind, path: &Path) -> Result<(), SnapshotError> {
        let file = File::create(path)
            .map_err(|source| SnapshotError::Create { path: path.to_path_buf(), source })?;

        let mut writer = BufWriter::new(file);
        self.instrumentation
            .write_profile(kind, &mut writer, kind.snapshot_debug_level())
            .map_err(|source| SnapshotError::Write { kind, source })?;

        let file = writer.into_inner().map_err(|e| SnapshotError::Close {
            path: path.to_path_buf(),
            source: e.into_error(),
        })?;
        file.sync_all()
            .map_err(|source| SnapshotError::Close { path: path.to_path_buf(), source })
    }

    fn run_cleanups(&self) -> usize {
        // Swap the list out so concurrent snapshots never run an action twice
        let cleanups = std::mem::take(&mut *lock(&self.cleanups));
        let count = cleanups.len();
        for cleanup in cleanups {
            cleanup();
        }
        count
    }
}

const fn title(kind: ProfileKind) -> &'static str {
    match kind {
        ProfileKind::Cpu => "CPU",
        ProfileKind::Memory => "Memory",
        ProfileKind::Block => "Block",
        ProfileKind::Goroutine => "Goroutine",
        ProfileKind::Mutex => "Mutex",
    }
}
