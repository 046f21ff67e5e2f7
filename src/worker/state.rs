//! Lock-free per-worker state.
//!
//! The dispatcher, the watcher, and the worker's wait thread all observe a
//! worker concurrently, so every field is an atomic and there are no locks.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Lifecycle status of a single worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    /// Constructed but not started.
    Inactive = 0,
    /// Idle and available for dispatch.
    Ready = 1,
    /// Executing a payload.
    Working = 2,
    /// Unusable; relay state is indeterminate.
    Invalid = 3,
    /// Soft termination in progress.
    Stopping = 4,
    /// Process has exited.
    Stopped = 5,
    /// Hard termination in progress.
    Killing = 6,
    /// Retired on purpose during pool shutdown.
    Destroyed = 7,
    /// Flagged unusable by an external supervisor.
    Errored = 8,
    /// Hit the per-worker job quota and awaits replacement.
    MaxJobsReached = 9,
}

impl Status {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Inactive,
            1 => Self::Ready,
            2 => Self::Working,
            3 => Self::Invalid,
            4 => Self::Stopping,
            5 => Self::Stopped,
            6 => Self::Killing,
            7 => Self::Destroyed,
            8 => Self::Errored,
            _ => Self::MaxJobsReached,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Inactive => "inactive",
            Self::Ready => "ready",
            Self::Working => "working",
            Self::Invalid => "invalid",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Killing => "killing",
            Self::Destroyed => "destroyed",
            Self::Errored => "errored",
            Self::MaxJobsReached => "max-jobs-reached",
        };
        write!(f, "{}", name)
    }
}

/// Shared, atomically-updated view of one worker.
#[derive(Debug)]
pub struct WorkerState {
    status: AtomicU8,
    num_execs: AtomicU64,
    last_used_ns: AtomicU64,
}

impl WorkerState {
    /// New state in `Status::Inactive`.
    pub fn new() -> Self {
        Self {
            status: AtomicU8::new(Status::Inactive as u8),
            num_execs: AtomicU64::new(0),
            last_used_ns: AtomicU64::new(0),
        }
    }

    /// Current status.
    pub fn value(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// Overwrite the status.
    pub fn set(&self, status: Status) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    /// True iff the worker is dispatchable or mid-execution.
    pub fn is_active(&self) -> bool {
        matches!(self.value(), Status::Ready | Status::Working)
    }

    /// Count one successful execution.
    pub fn register_exec(&self) {
        self.num_execs.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of successful executions so far.
    pub fn num_execs(&self) -> u64 {
        self.num_execs.load(Ordering::SeqCst)
    }

    /// Record the release timestamp, UNIX-epoch nanoseconds.
    pub fn set_last_used(&self, ns: u64) {
        self.last_used_ns.store(ns, Ordering::SeqCst);
    }

    /// Timestamp of the most recent release, UNIX-epoch nanoseconds.
    pub fn last_used(&self) -> u64 {
        self.last_used_ns.load(Ordering::SeqCst)
    }
}

impl Default for WorkerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Current wall clock as UNIX-epoch nanoseconds.
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
