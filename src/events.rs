//! Pool lifecycle events.
//!
//! The pool and the watcher report what happens to workers through an
//! [`EventBus`]; listeners are synchronous callbacks. Every push is also
//! mirrored into tracing so the events are visible without a listener.

use std::sync::{Arc, RwLock};

use tracing::debug;

/// Something that happened to a worker or to the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// A new worker finished its handshake and joined the cohort.
    WorkerConstruct { pid: i32 },
    /// A worker was retired on purpose during shutdown.
    WorkerDestruct { pid: i32 },
    /// A transport or job failure on a specific worker, or an allocation
    /// failure before any worker existed (`pid: None`).
    WorkerError { pid: Option<i32>, error: String },
    /// A worker process exited unexpectedly and will be replaced.
    WorkerProcessExit { pid: i32, error: String },
    /// An execution hit its deadline.
    ExecTimeout { pid: i32 },
    /// A take timed out with no ready worker available.
    NoFreeWorkers { error: String },
}

/// Synchronous event callback.
pub type Listener = Arc<dyn Fn(&PoolEvent) + Send + Sync>;

/// Fan-out registry of event listeners.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Listener>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for all subsequent events.
    pub fn add_listener(&self, listener: Listener) {
        self.listeners
            .write()
            .expect("listener lock poisoned")
            .push(listener);
    }

    /// Number of registered listeners.
    pub fn num_listeners(&self) -> usize {
        self.listeners.read().expect("listener lock poisoned").len()
    }

    /// Deliver an event to every listener, in registration order.
    pub fn push(&self, event: PoolEvent) {
        debug!(event = ?event, "pool event");
        let listeners = self.listeners.read().expect("listener lock poisoned");
        for listener in listeners.iter() {
            listener(&event);
        }
    }
}
