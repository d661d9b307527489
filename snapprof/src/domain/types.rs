//! Core domain types
//!
//! Newtypes and small enums shared by the controller, the instrumentation
//! backends and the artifact naming code.

use std::fmt;

/// One category of profiling data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProfileKind {
    /// Sampled on-CPU stacks
    Cpu,
    /// Sampled heap allocations
    Memory,
    /// Time spent blocked on instrumented waits
    Block,
    /// Every live thread of execution in the process
    Goroutine,
    /// Contended acquisitions of instrumented mutexes
    Mutex,
}

impl ProfileKind {
    /// All kinds, in snapshot order
    pub const ALL: [ProfileKind; 5] = [
        ProfileKind::Cpu,
        ProfileKind::Memory,
        ProfileKind::Block,
        ProfileKind::Goroutine,
        ProfileKind::Mutex,
    ];

    /// Label used in artifact file names
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            ProfileKind::Cpu => "cpu",
            ProfileKind::Memory => "mem",
            ProfileKind::Block => "block",
            ProfileKind::Goroutine => "goroutine",
            ProfileKind::Mutex => "mutex",
        }
    }

    /// Detail level used when the kind is dumped at snapshot time.
    ///
    /// 0 selects the compact protobuf encoding, anything above selects the
    /// human-readable rendition (2 adds full stacks).
    #[must_use]
    pub const fn snapshot_debug_level(self) -> u8 {
        match self {
            ProfileKind::Cpu | ProfileKind::Memory => 0,
            ProfileKind::Block | ProfileKind::Goroutine | ProfileKind::Mutex => 2,
        }
    }
}

impl fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Wall-clock time in whole seconds since the unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnixSeconds(pub u64);

impl fmt::Display for UnixSeconds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread ID as reported by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(pub u32);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TID:{}", self.0)
    }
}
