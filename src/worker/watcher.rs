//! Cohort ownership and worker lifecycle supervision.
//!
//! The watcher owns every live worker, mediates each handout through the
//! ready container, and runs one wait thread per worker that observes the
//! process exit and arranges a replacement.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::container::{Container, PopError};
use super::state::{now_ns, Status};
use super::SyncWorker;
use crate::error::{Error, Result};
use crate::events::{EventBus, PoolEvent};

/// Factory producing a new ready worker under the allocate timeout.
pub type Allocator = Arc<dyn Fn() -> Result<Arc<dyn SyncWorker>> + Send + Sync>;

/// Retry cadence of the background allocation loop.
const ALLOCATE_RETRY: Duration = Duration::from_millis(500);
/// Poll cadence while destroy waits for in-flight work to finish.
const DESTROY_POLL: Duration = Duration::from_millis(100);
/// Poll cadence while destroy waits for wait threads to reap the cohort.
const REAP_POLL: Duration = Duration::from_millis(10);

pub struct WorkerWatcher {
    container: Container,
    /// Authoritative list of live workers. The container holds the subset
    /// currently available for dispatch.
    cohort: RwLock<Vec<Arc<dyn SyncWorker>>>,
    /// Size the cohort converges to; shrinks when allocation fails
    /// terminally.
    num_workers_target: AtomicU64,
    allocator: Allocator,
    allocate_timeout: Duration,
    events: Arc<EventBus>,
    destroyed: AtomicBool,
    /// Set when the pool has no workers left and cannot allocate more.
    /// Every take after that fails with `Error::Fatal`.
    fatal: AtomicBool,
}

impl WorkerWatcher {
    pub fn new(
        allocator: Allocator,
        num_workers: usize,
        events: Arc<EventBus>,
        allocate_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            container: Container::new(num_workers),
            cohort: RwLock::new(Vec::with_capacity(num_workers)),
            num_workers_target: AtomicU64::new(num_workers as u64),
            allocator,
            allocate_timeout,
            events,
            destroyed: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
        })
    }

    /// Adopt a pre-allocated set of workers: register them in the cohort,
    /// make them available, and start their wait threads.
    pub fn watch(self: &Arc<Self>, workers: Vec<Arc<dyn SyncWorker>>) {
        for worker in workers {
            self.cohort
                .write()
                .expect("cohort lock poisoned")
                .push(Arc::clone(&worker));
            self.add_to_watch(Arc::clone(&worker));
            self.container.push(worker);
        }
    }

    /// Hand out a ready worker, blocking until one is available or the
    /// deadline fires.
    pub fn take(&self, deadline: Instant) -> Result<Arc<dyn SyncWorker>> {
        if self.fatal.load(Ordering::SeqCst) {
            return Err(Error::Fatal(
                "no workers left and allocation failed".into(),
            ));
        }

        let worker = self.pop(deadline)?;

        // Fast path: the popped worker is ready for work.
        if worker.state().value() == Status::Ready {
            return Ok(worker);
        }

        // Slow path: the worker soured while parked (TTL-ed, errored).
        // Kill it and keep popping; the wait threads refill the container.
        let _ = worker.kill();
        loop {
            let worker = self.pop(deadline)?;
            match worker.state().value() {
                Status::Ready => return Ok(worker),
                Status::Working => {
                    // Should not be parked while working; put it back and
                    // let it finish.
                    self.container.push(worker);
                    continue;
                }
                _ => {
                    let _ = worker.kill();
                    continue;
                }
            }
        }
    }

    fn pop(&self, deadline: Instant) -> Result<Arc<dyn SyncWorker>> {
        match self.container.pop(deadline) {
            Ok(worker) => Ok(worker),
            Err(PopError::Destroyed) => Err(Error::WatcherStopped),
            Err(PopError::TimedOut) => Err(Error::NoFreeWorkers),
        }
    }

    /// Return a worker after an execution: back into the container when it
    /// is still ready, otherwise kill it and let its wait thread arrange a
    /// replacement.
    pub fn release(&self, worker: Arc<dyn SyncWorker>) {
        worker.state().set_last_used(now_ns());
        if worker.state().value() == Status::Ready {
            self.container.push(worker);
        } else {
            let _ = worker.kill();
        }
    }

    /// Remove a worker from the cohort by pid and make sure it is dead.
    pub fn remove(&self, worker: &dyn SyncWorker) {
        let pid = worker.pid();
        let removed = {
            let mut cohort = self.cohort.write().expect("cohort lock poisoned");
            match cohort.iter().position(|w| w.pid() == pid) {
                Some(idx) => Some(cohort.remove(idx)),
                None => None,
            }
        };
        if let Some(worker) = removed {
            let _ = worker.kill();
        }
    }

    /// Produce a replacement worker and put it into circulation.
    ///
    /// Retries every 500 ms within the allocate timeout. On terminal
    /// failure the target cohort size shrinks by one.
    pub fn allocate(self: &Arc<Self>) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::WatcherStopped);
        }

        let worker = match (self.allocator)() {
            Ok(worker) => worker,
            Err(first_err) => {
                self.events.push(PoolEvent::WorkerError {
                    pid: None,
                    error: format!("can't allocate worker: {}", first_err),
                });

                if self.allocate_timeout.is_zero() {
                    return Err(Error::Allocate(first_err.to_string()));
                }

                let deadline = Instant::now() + self.allocate_timeout;
                loop {
                    std::thread::sleep(ALLOCATE_RETRY);
                    if Instant::now() >= deadline {
                        // Terminal failure: the cohort has shrunk.
                        self.num_workers_target.fetch_sub(1, Ordering::SeqCst);
                        return Err(Error::Allocate(first_err.to_string()));
                    }
                    if self.destroyed.load(Ordering::SeqCst) {
                        return Err(Error::WatcherStopped);
                    }
                    match (self.allocator)() {
                        Ok(worker) => break worker,
                        Err(retry_err) => {
                            self.events.push(PoolEvent::WorkerError {
                                pid: None,
                                error: format!(
                                    "can't allocate worker, retry attempt failed: {}",
                                    retry_err
                                ),
                            });
                        }
                    }
                }
            }
        };

        if self.destroyed.load(Ordering::SeqCst) {
            let _ = worker.kill();
            return Err(Error::WatcherStopped);
        }

        self.cohort
            .write()
            .expect("cohort lock poisoned")
            .push(Arc::clone(&worker));
        self.add_to_watch(Arc::clone(&worker));
        self.release(worker);
        Ok(())
    }

    /// Copy of the current cohort.
    pub fn list(&self) -> Vec<Arc<dyn SyncWorker>> {
        self.cohort.read().expect("cohort lock poisoned").clone()
    }

    /// Current target cohort size.
    pub fn num_workers_target(&self) -> u64 {
        self.num_workers_target.load(Ordering::SeqCst)
    }

    /// Drain the pool: no further handouts, in-flight executions complete,
    /// then every worker is retired and reaped. Deliberately ignores
    /// cancellation; callers wanting a bound impose it from outside.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.container.destroy();

        // Let executions in flight run to completion: converged when no
        // member is working and every member is parked in the container.
        // A worker handed out but not yet executing counts as in flight.
        loop {
            let queued = self.container.len();
            {
                let cohort = self.cohort.read().expect("cohort lock poisoned");
                let working = cohort
                    .iter()
                    .filter(|w| w.state().value() == Status::Working)
                    .count();
                if working == 0 && queued >= cohort.len() {
                    for worker in cohort.iter() {
                        worker.state().set(Status::Destroyed);
                        let _ = worker.kill();
                    }
                    break;
                }
                debug!(working, queued, "destroy waiting for in-flight executions");
            }
            std::thread::sleep(DESTROY_POLL);
        }
        self.container.drain();

        // Wait threads reap each worker and take it out of the cohort.
        loop {
            if self.cohort.read().expect("cohort lock poisoned").is_empty() {
                break;
            }
            std::thread::sleep(REAP_POLL);
        }
        info!("worker watcher destroyed");
    }

    /// Spawn the dedicated wait thread observing this worker's exit.
    fn add_to_watch(self: &Arc<Self>, worker: Arc<dyn SyncWorker>) {
        let watcher = Arc::downgrade(self);
        let pid = worker.pid();
        std::thread::Builder::new()
            .name(format!("worker-wait-{}", pid))
            .spawn(move || wait_loop(watcher, worker))
            .expect("failed to spawn worker wait thread");
    }
}

/// Body of the per-worker wait thread: observe the exit, then either settle
/// the shutdown or arrange a replacement.
fn wait_loop(watcher: Weak<WorkerWatcher>, worker: Arc<dyn SyncWorker>) {
    let wait_err = worker.wait().err();

    let Some(watcher) = watcher.upgrade() else {
        return;
    };
    let pid = worker.pid();

    if let Some(err) = &wait_err {
        watcher.events.push(PoolEvent::WorkerError {
            pid: Some(pid),
            error: err.to_string(),
        });
    }

    watcher.remove(worker.as_ref());

    if worker.state().value() == Status::Destroyed || watcher.destroyed.load(Ordering::SeqCst) {
        // Retired on purpose; nothing to replace.
        watcher.events.push(PoolEvent::WorkerDestruct { pid });
        return;
    }

    worker.state().set(Status::Stopped);
    watcher.events.push(PoolEvent::WorkerProcessExit {
        pid,
        error: wait_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "worker exited unexpectedly".into()),
    });

    if let Err(err) = watcher.allocate() {
        if matches!(err, Error::WatcherStopped) {
            return;
        }
        warn!(pid, error = %err, "failed to replace exited worker");

        let cohort_empty = watcher
            .cohort
            .read()
            .expect("cohort lock poisoned")
            .is_empty();
        if cohort_empty && watcher.num_workers_target.load(Ordering::SeqCst) == 0 {
            watcher.fatal.store(true, Ordering::SeqCst);
            error!("pool cannot recover: no workers left and allocation failed");
        }
    }
}
