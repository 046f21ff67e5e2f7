//! Pool configuration.

use std::time::Duration;

/// Fallback for zero allocate/destroy timeouts.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Configuration for a static worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Target cohort size.
    pub num_workers: usize,
    /// Per-worker job quota before forced rotation. 0 means unbounded.
    pub max_jobs: u64,
    /// Maximum wait for a free worker, and the window the background
    /// allocation retry loop runs within.
    pub allocate_timeout: Duration,
    /// Advisory shutdown bound. Destroy itself waits for in-flight work;
    /// callers wanting a hard bound impose it from outside.
    pub destroy_timeout: Duration,
    /// Present when an external supervisor decorates the pool.
    pub supervisor: Option<SupervisorConfig>,
    /// Single-use worker per request; disables pooling.
    pub debug: bool,
}

/// Knobs recognized for an external supervisor. The pool itself does not
/// enforce these; they are carried for whoever decorates it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// How often the supervisor inspects the cohort.
    pub watch_tick: Duration,
    /// Maximum worker lifetime.
    pub ttl: Duration,
    /// Maximum time a worker may sit idle.
    pub idle_ttl: Duration,
    /// Per-execution deadline applied by the supervisor.
    pub exec_ttl: Duration,
    /// Memory ceiling per worker, MiB.
    pub max_worker_memory_mib: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            max_jobs: 0,
            allocate_timeout: DEFAULT_TIMEOUT,
            destroy_timeout: DEFAULT_TIMEOUT,
            supervisor: None,
            debug: false,
        }
    }
}

impl Config {
    /// Fill in defaults and apply the debug overrides.
    ///
    /// Debug mode disables pooling: no resident workers, one job per
    /// worker.
    pub fn normalize(&mut self) {
        if self.debug {
            self.num_workers = 0;
            self.max_jobs = 1;
        }
        if self.allocate_timeout.is_zero() {
            self.allocate_timeout = DEFAULT_TIMEOUT;
        }
        if self.destroy_timeout.is_zero() {
            self.destroy_timeout = DEFAULT_TIMEOUT;
        }
    }
}
