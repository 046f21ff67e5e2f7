//! Ready-worker container.
//!
//! A FIFO of ready workers with a blocking, deadline-bounded pop and a
//! monotonic destroy gate. Fairness matters here: a pushed worker is handed
//! directly to the oldest parked pop, so waiters are served in arrival
//! order rather than at the mercy of condvar wakeup order.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use tracing::trace;

use super::SyncWorker;

/// Why a pop attempt returned no worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    /// Destroy was invoked; nothing is handed out anymore.
    Destroyed,
    /// The caller's deadline elapsed.
    TimedOut,
}

enum WaiterState {
    /// Parked, waiting for a worker.
    Waiting,
    /// A push handed this waiter a worker.
    Handed(Arc<dyn SyncWorker>),
    /// Destroy unparked this waiter empty-handed.
    Stopped,
    /// The waiter gave up; pushes must skip this slot.
    Abandoned,
}

struct Waiter {
    state: Mutex<WaiterState>,
    cv: Condvar,
}

impl Waiter {
    fn new() -> Self {
        Self {
            state: Mutex::new(WaiterState::Waiting),
            cv: Condvar::new(),
        }
    }
}

struct Inner {
    queue: VecDeque<Arc<dyn SyncWorker>>,
    waiters: VecDeque<Arc<Waiter>>,
    destroyed: bool,
}

/// FIFO container of ready workers.
pub struct Container {
    inner: Mutex<Inner>,
}

impl Container {
    /// Create a container sized for the cohort target.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity),
                waiters: VecDeque::new(),
                destroyed: false,
            }),
        }
    }

    /// Offer a worker. Never blocks: the oldest parked pop receives it, or
    /// it is queued. After destroy the worker is killed and dropped.
    pub fn push(&self, worker: Arc<dyn SyncWorker>) {
        let mut inner = self.inner.lock().expect("container mutex poisoned");
        if inner.destroyed {
            drop(inner);
            trace!(pid = worker.pid(), "push after destroy, killing worker");
            let _ = worker.kill();
            return;
        }

        while let Some(waiter) = inner.waiters.pop_front() {
            let mut state = waiter.state.lock().expect("waiter mutex poisoned");
            if matches!(*state, WaiterState::Waiting) {
                *state = WaiterState::Handed(worker);
                waiter.cv.notify_one();
                return;
            }
            // Abandoned slot left behind by a timed-out pop; skip it.
        }
        inner.queue.push_back(worker);
    }

    /// Block until a worker is available, the deadline fires, or the
    /// container is destroyed.
    pub fn pop(&self, deadline: Instant) -> Result<Arc<dyn SyncWorker>, PopError> {
        let waiter = {
            let mut inner = self.inner.lock().expect("container mutex poisoned");
            if inner.destroyed {
                return Err(PopError::Destroyed);
            }
            if let Some(worker) = inner.queue.pop_front() {
                return Ok(worker);
            }
            let waiter = Arc::new(Waiter::new());
            inner.waiters.push_back(Arc::clone(&waiter));
            waiter
        };

        let mut state = waiter.state.lock().expect("waiter mutex poisoned");
        loop {
            match std::mem::replace(&mut *state, WaiterState::Waiting) {
                WaiterState::Handed(worker) => return Ok(worker),
                WaiterState::Stopped => {
                    *state = WaiterState::Stopped;
                    return Err(PopError::Destroyed);
                }
                WaiterState::Waiting => {}
                WaiterState::Abandoned => unreachable!("abandoned by ourselves"),
            }

            let now = Instant::now();
            if now >= deadline {
                *state = WaiterState::Abandoned;
                return Err(PopError::TimedOut);
            }
            let (next, _) = waiter
                .cv
                .wait_timeout(state, deadline - now)
                .expect("waiter mutex poisoned");
            state = next;
        }
    }

    /// Set the monotonic destroy gate and unpark every pending pop.
    pub fn destroy(&self) {
        let waiters = {
            let mut inner = self.inner.lock().expect("container mutex poisoned");
            inner.destroyed = true;
            std::mem::take(&mut inner.waiters)
        };
        for waiter in waiters {
            let mut state = waiter.state.lock().expect("waiter mutex poisoned");
            if matches!(*state, WaiterState::Waiting) {
                *state = WaiterState::Stopped;
                waiter.cv.notify_one();
            }
        }
    }

    /// Drop every queued worker reference.
    pub fn drain(&self) {
        let mut inner = self.inner.lock().expect("container mutex poisoned");
        inner.queue.clear();
    }

    /// Number of queued (not handed-out) workers.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("container mutex poisoned").queue.len()
    }

    /// True when no worker is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
