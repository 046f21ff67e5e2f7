//! Static worker pool: the dispatch surface.
//!
//! The pool owns a [`WorkerWatcher`], routes each payload to one worker,
//! classifies execution failures, and applies the stop-request and
//! max-jobs rotation policies.

use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{EventBus, Listener, PoolEvent};
use crate::payload::Payload;
use crate::worker::{Allocator, ChildWorker, Status, SyncWorker, WorkerWatcher};

/// Factory for the worker command line. Invoked once per spawned worker.
pub type CommandFactory = Arc<dyn Fn() -> Command + Send + Sync>;

/// Fixed-size pool of worker processes fed over a framed relay.
pub struct StaticPool {
    cfg: Config,
    events: Arc<EventBus>,
    watcher: Arc<WorkerWatcher>,
    allocator: Allocator,
}

impl std::fmt::Debug for StaticPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticPool").field("cfg", &self.cfg).finish_non_exhaustive()
    }
}

impl StaticPool {
    /// Build a pool: allocate the full cohort up front and start watching
    /// it. Fails if any worker cannot be spawned and handshaken, killing
    /// whatever was already allocated.
    pub fn new(cfg: Config, cmd: CommandFactory) -> Result<Self> {
        Self::with_listeners(cfg, cmd, Vec::new())
    }

    /// Same as [`Self::new`] with event listeners registered before the
    /// first worker is constructed.
    pub fn with_listeners(
        mut cfg: Config,
        cmd: CommandFactory,
        listeners: Vec<Listener>,
    ) -> Result<Self> {
        cfg.normalize();

        let events = Arc::new(EventBus::new());
        for listener in listeners {
            events.add_listener(listener);
        }

        let allocator = pool_allocator(cmd, cfg.allocate_timeout, Arc::clone(&events));
        Self::with_allocator(cfg, allocator, events)
    }

    fn with_allocator(cfg: Config, allocator: Allocator, events: Arc<EventBus>) -> Result<Self> {
        let watcher = WorkerWatcher::new(
            Arc::clone(&allocator),
            cfg.num_workers,
            Arc::clone(&events),
            cfg.allocate_timeout,
        );

        let mut workers = Vec::with_capacity(cfg.num_workers);
        for _ in 0..cfg.num_workers {
            match allocator() {
                Ok(worker) => workers.push(worker),
                Err(err) => {
                    // Do not leak what was already spawned.
                    for worker in &workers {
                        let _ = worker.kill();
                    }
                    return Err(err);
                }
            }
        }
        watcher.watch(workers);

        info!(
            num_workers = cfg.num_workers,
            max_jobs = cfg.max_jobs,
            debug = cfg.debug,
            "worker pool initialized"
        );

        Ok(Self {
            cfg,
            events,
            watcher,
            allocator,
        })
    }

    /// Pool configuration. Immutable.
    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Register an event listener.
    pub fn add_listener(&self, listener: Listener) {
        self.events.add_listener(listener);
    }

    /// Snapshot of the current cohort.
    pub fn workers(&self) -> Vec<Arc<dyn SyncWorker>> {
        self.watcher.list()
    }

    /// Remove a worker from the pool by hand.
    pub fn remove_worker(&self, worker: &dyn SyncWorker) {
        self.watcher.remove(worker);
    }

    /// Execute one payload on a pooled worker.
    pub fn exec(&self, request: &Payload) -> Result<Payload> {
        self.exec_inner(None, request)
    }

    /// Execute one payload, aborting when `timeout` elapses. The worker
    /// that missed the deadline is retired; the error is [`Error::ExecTimeout`].
    pub fn exec_with_deadline(&self, timeout: Duration, request: &Payload) -> Result<Payload> {
        self.exec_inner(Some(timeout), request)
    }

    fn exec_inner(&self, timeout: Option<Duration>, request: &Payload) -> Result<Payload> {
        if self.cfg.debug {
            return self.exec_debug(timeout, request);
        }

        // Retried when a worker answers with the stop request: the worker
        // retires and the payload runs again on a fresh take. Unbounded in
        // count, but every attempt is bounded by its own take deadline.
        loop {
            let worker = self.take_worker()?;

            let result = match timeout {
                Some(timeout) => worker.exec_with_deadline(timeout, request),
                None => worker.exec(request),
            };
            let reply = match result {
                Ok(reply) => reply,
                Err(err) => return self.encode_error(err, &worker),
            };

            if reply.is_stop_request() {
                self.stop_worker(&worker);
                continue;
            }

            if self.cfg.max_jobs > 0 && worker.state().num_execs() >= self.cfg.max_jobs {
                worker.state().set(Status::MaxJobsReached);
            }
            self.watcher.release(worker);
            return Ok(reply);
        }
    }

    fn take_worker(&self) -> Result<Arc<dyn SyncWorker>> {
        let deadline = Instant::now() + self.cfg.allocate_timeout;
        match self.watcher.take(deadline) {
            Ok(worker) => Ok(worker),
            Err(err @ Error::NoFreeWorkers) => {
                self.events.push(PoolEvent::NoFreeWorkers {
                    error: err.to_string(),
                });
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Retire a worker that asked to be terminated.
    fn stop_worker(&self, worker: &Arc<dyn SyncWorker>) {
        worker.state().set(Status::Invalid);
        if let Err(err) = worker.stop() {
            self.events.push(PoolEvent::WorkerError {
                pid: Some(worker.pid()),
                error: err.to_string(),
            });
        }
    }

    /// Classify an execution failure and apply the remediation: which state
    /// the worker ends in, whether it is released, stopped, or killed, and
    /// which event fires.
    fn encode_error(&self, err: Error, worker: &Arc<dyn SyncWorker>) -> Result<Payload> {
        let pid = worker.pid();
        match err {
            Error::ExecTimeout => {
                self.events.push(PoolEvent::ExecTimeout { pid });
                // The relay may still deliver the late reply; never reuse.
                worker.state().set(Status::Invalid);
                Err(Error::ExecTimeout)
            }

            Error::SoftJob(message) => {
                self.events.push(PoolEvent::WorkerError {
                    pid: Some(pid),
                    error: message.clone(),
                });

                if self.cfg.max_jobs > 0 && worker.state().num_execs() >= self.cfg.max_jobs {
                    // Quota exhausted on a failing job: rotate instead of
                    // releasing.
                    worker.state().set(Status::Invalid);
                    if let Err(stop_err) = worker.stop() {
                        warn!(pid, error = %stop_err, "failed to stop rotated worker");
                    }
                    return Err(Error::SoftJob(message));
                }

                // Job errors leave the worker healthy; put it back.
                self.watcher.release(Arc::clone(worker));
                Err(Error::SoftJob(message))
            }

            Error::Network(message) => {
                worker.state().set(Status::Invalid);
                self.events.push(PoolEvent::WorkerError {
                    pid: Some(pid),
                    error: message.clone(),
                });
                // No point talking to it anymore.
                let _ = worker.kill();
                Err(Error::Network(message))
            }

            other => {
                worker.state().set(Status::Invalid);
                self.events.push(PoolEvent::WorkerDestruct { pid });
                if let Err(stop_err) = worker.stop() {
                    warn!(pid, error = %stop_err, "failed to stop broken worker");
                }
                Err(other)
            }
        }
    }

    /// Debug path: a brand-new worker per request, killed afterwards.
    fn exec_debug(&self, timeout: Option<Duration>, request: &Payload) -> Result<Payload> {
        let worker = (self.allocator)()?;

        let result = match timeout {
            Some(timeout) => worker.exec_with_deadline(timeout, request),
            None => worker.exec(request),
        };

        worker.state().set(Status::Destroyed);
        if let Err(err) = worker.kill() {
            self.events.push(PoolEvent::WorkerError {
                pid: Some(worker.pid()),
                error: err.to_string(),
            });
        }
        result
    }

    /// Drain the pool: in-flight executions complete, every worker is
    /// retired, and no worker process survives the call.
    pub fn destroy(&self) {
        self.watcher.destroy();
    }
}

impl Drop for StaticPool {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Build the allocator closure: spawn, attach the relay, and consume the
/// readiness handshake under the allocate timeout.
fn pool_allocator(
    cmd: CommandFactory,
    allocate_timeout: Duration,
    events: Arc<EventBus>,
) -> Allocator {
    Arc::new(move || {
        let deadline = Instant::now() + allocate_timeout;
        let worker = ChildWorker::start(cmd())?;
        if let Err(err) = worker.handshake(deadline) {
            // No wait thread exists yet; reap inline so nothing leaks.
            let _ = worker.kill();
            return Err(err);
        }

        let worker: Arc<dyn SyncWorker> = Arc::new(worker);
        events.push(PoolEvent::WorkerConstruct { pid: worker.pid() });
        Ok(worker)
    })
}
