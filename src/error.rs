//! Error types for stoker.

use thiserror::Error;

/// Main error type for pool operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("no free workers within the allocate timeout")]
    NoFreeWorkers,

    #[error("worker watcher has been stopped")]
    WatcherStopped,

    #[error("worker allocation failed: {0}")]
    Allocate(String),

    #[error("execution deadline exceeded")]
    ExecTimeout,

    #[error("job error reported by worker: {0}")]
    SoftJob(String),

    #[error("worker relay failure: {0}")]
    Network(String),

    #[error("frame decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("failed to spawn worker process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("worker did not complete the handshake in time")]
    HandshakeTimeout,

    #[error("worker handshake violated the protocol: {0}")]
    HandshakeProtocol(String),

    #[error("pool is fatally degraded: {0}")]
    Fatal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
