//! Framed relay between the pool and a worker process.
//!
//! A relay ships [`Frame`]s in both directions. The pool sends exactly one
//! request frame per execution and reads exactly one reply frame before the
//! worker is considered ready again. The core imposes no wire encoding;
//! [`pipes::PipeRelay`] is the bundled realization (one JSON object per
//! line over the worker's stdio pipes).

mod pipes;

pub use pipes::{PipeFd, PipeRelay};

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Frame flag bit: the body carries a job error message instead of a reply.
pub const FLAG_ERROR: u8 = 1 << 0;

/// Context of the one-time handshake frame a worker sends once it is ready
/// to accept requests.
pub const READY_CONTEXT: &[u8] = b"{\"ready\":true}";

/// A single unit of relay traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Flag bits, see [`FLAG_ERROR`].
    #[serde(default)]
    pub flags: u8,
    /// Opaque metadata bytes.
    #[serde(default)]
    pub context: Vec<u8>,
    /// Opaque body bytes.
    #[serde(default)]
    pub body: Vec<u8>,
}

impl Frame {
    /// Create a plain frame from context and body bytes.
    pub fn new(context: impl Into<Vec<u8>>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            flags: 0,
            context: context.into(),
            body: body.into(),
        }
    }

    /// Create an error frame whose body is the job error message.
    pub fn job_error(message: impl Into<Vec<u8>>) -> Self {
        Self {
            flags: FLAG_ERROR,
            context: Vec::new(),
            body: message.into(),
        }
    }

    /// The handshake frame a worker sends when it becomes ready.
    pub fn handshake() -> Self {
        Self::new(READY_CONTEXT, Vec::new())
    }

    /// True if the error flag bit is set.
    pub fn is_error(&self) -> bool {
        self.flags & FLAG_ERROR != 0
    }

    /// True if this is the readiness handshake.
    pub fn is_handshake(&self) -> bool {
        self.body.is_empty() && self.context == READY_CONTEXT
    }
}

/// Outcome of a receive attempt.
#[derive(Debug)]
pub enum RecvOutcome {
    /// A complete frame arrived.
    Frame(Frame),
    /// The peer closed its end of the relay.
    Closed,
    /// The deadline elapsed before a complete frame arrived.
    TimedOut,
}

/// Bi-directional framed transport to a single worker.
pub trait Relay: Send {
    /// Ship one frame to the worker.
    fn send(&mut self, frame: &Frame) -> Result<()>;

    /// Block until a frame arrives or the peer closes the relay.
    fn recv(&mut self) -> Result<RecvOutcome>;

    /// Block until a frame arrives, the peer closes the relay, or the
    /// deadline elapses. After `RecvOutcome::TimedOut` the relay state is
    /// indeterminate: a reply may still be mid-flight.
    fn recv_deadline(&mut self, deadline: Instant) -> Result<RecvOutcome>;
}
