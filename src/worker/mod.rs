//! Worker handles and per-worker lifecycle.
//!
//! The pool depends on a worker only through the [`SyncWorker`] capability
//! set. [`ChildWorker`] is the process-backed implementation: a spawned
//! subprocess with a framed relay attached to its stdio pipes.

pub mod container;
pub mod process;
pub mod state;
pub mod watcher;

pub use process::ChildWorker;
pub use state::{Status, WorkerState};
pub use watcher::{Allocator, WorkerWatcher};

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::payload::Payload;

/// Capability set of a pooled worker.
///
/// One payload at a time: the pool serializes executions on a single worker
/// through the container round-trip, so `exec` is never re-entered while a
/// previous call is still in flight.
pub trait SyncWorker: Send + Sync + std::fmt::Debug {
    /// OS process id of the worker.
    fn pid(&self) -> i32;

    /// When the worker was constructed.
    fn created(&self) -> DateTime<Utc>;

    /// Shared lifecycle state.
    fn state(&self) -> &WorkerState;

    /// Block until the worker process exits and report how it went.
    ///
    /// Called exactly once per worker, by its dedicated wait thread.
    fn wait(&self) -> Result<()>;

    /// Run one payload round-trip with no deadline.
    fn exec(&self, request: &Payload) -> Result<Payload>;

    /// Run one payload round-trip, aborting when `timeout` elapses. After a
    /// timeout the worker is invalid: the reply may still be mid-flight.
    fn exec_with_deadline(&self, timeout: Duration, request: &Payload) -> Result<Payload>;

    /// Soft termination: ask the worker to exit, escalate if it refuses.
    fn stop(&self) -> Result<()>;

    /// Hard termination. Always safe, idempotent.
    fn kill(&self) -> Result<()>;
}
