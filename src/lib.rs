//! stoker - process-pool execution engine.
//!
//! Keeps a fixed-size cohort of worker subprocesses alive, feeds each
//! request payload to one worker over a framed stdio relay, applies
//! deadlines and per-worker job quotas, replaces dead workers in the
//! background, and drains cleanly on shutdown.
//!
//! # Example
//!
//! ```no_run
//! use std::process::Command;
//! use std::sync::Arc;
//! use stoker::{Config, Payload, StaticPool};
//!
//! let pool = StaticPool::new(
//!     Config { num_workers: 4, ..Config::default() },
//!     Arc::new(|| Command::new("my-worker")),
//! )?;
//!
//! let reply = pool.exec(&Payload::from_body("job data"))?;
//! println!("worker replied with {} bytes", reply.body.len());
//!
//! pool.destroy();
//! # Ok::<(), stoker::Error>(())
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod payload;
pub mod pool;
pub mod relay;
pub mod worker;
pub mod worker_main;

pub use config::{Config, SupervisorConfig};
pub use error::{Error, Result};
pub use events::{EventBus, Listener, PoolEvent};
pub use payload::Payload;
pub use pool::{CommandFactory, StaticPool};
pub use worker::{ChildWorker, Status, SyncWorker, WorkerState, WorkerWatcher};
