//! Child-process-backed worker.
//!
//! Wraps a spawned subprocess with a framed relay on its stdio pipes.
//! stderr is drained by a named thread into tracing, with a short tail
//! retained for exit diagnostics.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::os::unix::io::OwnedFd;
use std::process::{ChildStderr, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, warn};

use super::state::{Status, WorkerState};
use super::SyncWorker;
use crate::error::{Error, Result};
use crate::payload::{Payload, STOP_REQUEST};
use crate::relay::{Frame, PipeFd, PipeRelay, RecvOutcome, Relay};

/// Lines of stderr retained for exit diagnostics.
const STDERR_TAIL_LINES: usize = 16;
/// Grace period for soft termination before escalating to SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(5);
/// Grace period for the reap to land after SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);
/// Polling interval while reaping a worker that has no wait thread.
const REAP_POLL: Duration = Duration::from_millis(10);

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// Could not be determined (already reaped elsewhere).
    Unknown,
}

impl ExitReason {
    /// True for a zero exit status.
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {}", code),
            Self::Signaled(sig) => write!(f, "killed by signal {:?}", sig),
            Self::Unknown => write!(f, "exited for an unknown reason"),
        }
    }
}

fn analyze_wait_status(status: WaitStatus) -> ExitReason {
    match status {
        WaitStatus::Exited(_, code) => ExitReason::Exited(code),
        WaitStatus::Signaled(_, signal, _) => ExitReason::Signaled(signal),
        _ => ExitReason::Unknown,
    }
}

/// Latched exit status, shared between the reaper and anyone awaiting it.
struct ExitGate {
    reason: Mutex<Option<ExitReason>>,
    cv: Condvar,
}

impl ExitGate {
    fn new() -> Self {
        Self {
            reason: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    fn set(&self, reason: ExitReason) {
        let mut guard = self.reason.lock().expect("exit gate mutex poisoned");
        if guard.is_none() {
            *guard = Some(reason);
        }
        self.cv.notify_all();
    }

    fn get(&self) -> Option<ExitReason> {
        *self.reason.lock().expect("exit gate mutex poisoned")
    }

    fn wait_timeout(&self, timeout: Duration) -> Option<ExitReason> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.reason.lock().expect("exit gate mutex poisoned");
        loop {
            if let Some(reason) = *guard {
                return Some(reason);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (next, _) = self
                .cv
                .wait_timeout(guard, deadline - now)
                .expect("exit gate mutex poisoned");
            guard = next;
        }
    }
}

/// A worker backed by a spawned subprocess and a pipe relay.
pub struct ChildWorker {
    pid: Pid,
    created: DateTime<Utc>,
    state: WorkerState,
    relay: Mutex<Box<dyn Relay>>,
    gate: ExitGate,
    /// Set once a dedicated wait thread owns the blocking reap; stop/kill
    /// then await the gate instead of reaping themselves.
    reap_claimed: AtomicBool,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl std::fmt::Debug for ChildWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildWorker")
            .field("pid", &self.pid.as_raw())
            .field("state", &self.state.value())
            .finish()
    }
}

impl ChildWorker {
    /// Spawn the command with piped stdio and attach a relay.
    ///
    /// The worker starts Inactive; it becomes Ready once [`Self::handshake`]
    /// has seen the readiness frame.
    pub fn start(mut cmd: Command) -> Result<Self> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(Error::Spawn)?;
        let pid = Pid::from_raw(child.id() as i32);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Network("child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Network("child stdout not captured".into()))?;

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        if let Some(stderr) = child.stderr.take() {
            let tail = Arc::clone(&stderr_tail);
            let raw = pid.as_raw();
            std::thread::Builder::new()
                .name(format!("worker-stderr-{}", raw))
                .spawn(move || drain_stderr(raw, stderr, tail))
                .ok(); // stderr logging is best-effort
        }

        let relay = PipeRelay::new(
            PipeFd::new(OwnedFd::from(stdout)),
            PipeFd::new(OwnedFd::from(stdin)),
        );

        debug!(pid = pid.as_raw(), "spawned worker process");

        Ok(Self {
            pid,
            created: Utc::now(),
            state: WorkerState::new(),
            relay: Mutex::new(Box::new(relay)),
            gate: ExitGate::new(),
            reap_claimed: AtomicBool::new(false),
            stderr_tail,
        })
    }

    /// Consume the readiness handshake and transition Inactive → Ready.
    pub fn handshake(&self, deadline: Instant) -> Result<()> {
        let mut relay = self.relay.lock().expect("relay mutex poisoned");
        match relay.recv_deadline(deadline)? {
            RecvOutcome::Frame(frame) if frame.is_handshake() => {
                self.state.set(Status::Ready);
                Ok(())
            }
            RecvOutcome::Frame(frame) => Err(Error::HandshakeProtocol(format!(
                "worker {} sent an unexpected first frame (flags {:#x}, {} body bytes)",
                self.pid,
                frame.flags,
                frame.body.len()
            ))),
            RecvOutcome::Closed => Err(Error::HandshakeProtocol(format!(
                "worker {} closed the relay before the handshake",
                self.pid
            ))),
            RecvOutcome::TimedOut => Err(Error::HandshakeTimeout),
        }
    }

    fn exec_inner(&self, deadline: Option<Instant>, request: &Payload) -> Result<Payload> {
        if self.state.value() != Status::Ready {
            return Err(Error::SoftJob(format!(
                "worker {} is not ready ({})",
                self.pid,
                self.state.value()
            )));
        }
        self.state.set(Status::Working);

        let mut relay = self.relay.lock().expect("relay mutex poisoned");
        let request_frame = Frame::new(request.context.clone(), request.body.clone());
        if let Err(e) = relay.send(&request_frame) {
            self.state.set(Status::Invalid);
            return Err(Error::Network(format!(
                "worker {} request send failed: {}",
                self.pid, e
            )));
        }

        let outcome = match deadline {
            Some(deadline) => relay.recv_deadline(deadline),
            None => relay.recv(),
        };
        drop(relay);

        let reply = match outcome {
            Ok(RecvOutcome::Frame(frame)) => frame,
            Ok(RecvOutcome::Closed) => {
                self.state.set(Status::Invalid);
                return Err(Error::Network(format!(
                    "worker {} closed the relay mid-exec",
                    self.pid
                )));
            }
            Ok(RecvOutcome::TimedOut) => {
                // The reply may still be mid-flight; the relay is unusable.
                self.state.set(Status::Invalid);
                let _ = self.kill();
                return Err(Error::ExecTimeout);
            }
            Err(Error::Io(e)) => {
                self.state.set(Status::Invalid);
                return Err(Error::Network(format!(
                    "worker {} reply receive failed: {}",
                    self.pid, e
                )));
            }
            Err(e) => {
                self.state.set(Status::Invalid);
                return Err(e);
            }
        };

        if reply.is_error() {
            self.state.set(Status::Ready);
            return Err(Error::SoftJob(
                String::from_utf8_lossy(&reply.body).into_owned(),
            ));
        }

        self.state.set(Status::Ready);
        self.state.register_exec();
        Ok(Payload::new(reply.body, reply.context))
    }

    /// Wait for the exit to land, either passively (a wait thread owns the
    /// reap) or by polling waitpid ourselves. Returns false on timeout.
    fn await_exit(&self, timeout: Duration) -> bool {
        if self.reap_claimed.load(Ordering::SeqCst) {
            self.gate.wait_timeout(timeout).is_some()
        } else {
            self.poll_reap(timeout)
        }
    }

    /// WNOHANG reap loop for workers without a wait thread.
    fn poll_reap(&self, timeout: Duration) -> bool {
        if self.gate.get().is_some() {
            return true;
        }
        let deadline = Instant::now() + timeout;
        loop {
            match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {}
                Ok(status) => {
                    self.gate.set(analyze_wait_status(status));
                    return true;
                }
                Err(_) => {
                    // Reaped elsewhere or the pid is gone either way.
                    self.gate.set(ExitReason::Unknown);
                    return true;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(REAP_POLL);
        }
    }

    fn stderr_excerpt(&self) -> String {
        let tail = self.stderr_tail.lock().expect("stderr tail mutex poisoned");
        if tail.is_empty() {
            String::new()
        } else {
            format!(
                "; stderr: {}",
                tail.iter().cloned().collect::<Vec<_>>().join(" | ")
            )
        }
    }
}

impl SyncWorker for ChildWorker {
    fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    fn created(&self) -> DateTime<Utc> {
        self.created
    }

    fn state(&self) -> &WorkerState {
        &self.state
    }

    fn wait(&self) -> Result<()> {
        self.reap_claimed.store(true, Ordering::SeqCst);
        let reason = match waitpid(self.pid, None) {
            Ok(status) => analyze_wait_status(status),
            Err(Errno::ECHILD) => self.gate.get().unwrap_or(ExitReason::Unknown),
            Err(e) => {
                self.gate.set(ExitReason::Unknown);
                return Err(Error::Network(format!(
                    "waitpid for worker {} failed: {}",
                    self.pid, e
                )));
            }
        };
        self.gate.set(reason);

        if reason.is_clean() {
            Ok(())
        } else {
            Err(Error::Network(format!(
                "worker {} {}{}",
                self.pid,
                reason,
                self.stderr_excerpt()
            )))
        }
    }

    fn exec(&self, request: &Payload) -> Result<Payload> {
        self.exec_inner(None, request)
    }

    fn exec_with_deadline(&self, timeout: Duration, request: &Payload) -> Result<Payload> {
        self.exec_inner(Some(Instant::now() + timeout), request)
    }

    fn stop(&self) -> Result<()> {
        if self.gate.get().is_some() {
            if self.state.value() != Status::Destroyed {
                self.state.set(Status::Stopped);
            }
            return Ok(());
        }
        self.state.set(Status::Stopping);

        {
            let mut relay = self.relay.lock().expect("relay mutex poisoned");
            // The worker may already be gone; the reap below is what counts.
            let _ = relay.send(&Frame::new(STOP_REQUEST, Vec::new()));
        }

        if !self.await_exit(STOP_GRACE) {
            warn!(
                pid = self.pid.as_raw(),
                "worker ignored the stop request, escalating to SIGKILL"
            );
            let _ = signal::kill(self.pid, Signal::SIGKILL);
            self.await_exit(KILL_GRACE);
        }

        self.state.set(Status::Stopped);
        Ok(())
    }

    fn kill(&self) -> Result<()> {
        let destroyed = self.state.value() == Status::Destroyed;
        if self.gate.get().is_some() {
            if !destroyed {
                self.state.set(Status::Stopped);
            }
            return Ok(());
        }
        if !destroyed {
            self.state.set(Status::Killing);
        }

        match signal::kill(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => {
                return Err(Error::Network(format!(
                    "SIGKILL for worker {} failed: {}",
                    self.pid, e
                )))
            }
        }
        self.await_exit(KILL_GRACE);

        if !destroyed {
            self.state.set(Status::Stopped);
        }
        Ok(())
    }
}

impl Drop for ChildWorker {
    fn drop(&mut self) {
        if self.gate.get().is_none() && !self.reap_claimed.load(Ordering::SeqCst) {
            let _ = signal::kill(self.pid, Signal::SIGKILL);
            self.poll_reap(Duration::from_millis(200));
        }
    }
}

/// Drain a worker's stderr through tracing, retaining a short tail.
fn drain_stderr(pid: i32, stderr: ChildStderr, tail: Arc<Mutex<VecDeque<String>>>) {
    let reader = BufReader::new(stderr);
    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            Err(_) => break, // Pipe closed
        };
        if line.trim().is_empty() {
            continue;
        }
        debug!(worker_pid = pid, "{}", line);

        let mut tail = tail.lock().expect("stderr tail mutex poisoned");
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn test_spawn_and_kill() {
        let worker = ChildWorker::start(sh("sleep 60")).expect("spawn");
        assert_eq!(worker.state().value(), Status::Inactive);
        assert!(worker.pid() > 0);

        worker.kill().expect("kill");
        assert_eq!(worker.state().value(), Status::Stopped);

        // Killing again is a no-op
        worker.kill().expect("second kill");
    }

    #[test]
    fn test_wait_reports_clean_exit() {
        let worker = ChildWorker::start(sh("exit 0")).expect("spawn");
        assert!(worker.wait().is_ok());
    }

    #[test]
    fn test_wait_includes_stderr_tail() {
        let worker = ChildWorker::start(sh("echo boom >&2; exit 3")).expect("spawn");
        let err = worker.wait().expect_err("non-zero exit");
        let msg = err.to_string();
        assert!(msg.contains("code 3"), "message was: {}", msg);
        assert!(msg.contains("boom"), "message was: {}", msg);
    }

    #[test]
    fn test_stop_exits_line_reader_child() {
        // The child exits as soon as it reads one line, which is exactly
        // what the stop frame provides.
        let worker = ChildWorker::start(sh("read _line; exit 0")).expect("spawn");
        worker.stop().expect("stop");
        assert_eq!(worker.state().value(), Status::Stopped);
    }

    #[test]
    fn test_handshake_protocol_violation() {
        let worker = ChildWorker::start(sh("echo '{\"flags\":0,\"context\":[],\"body\":[1]}'"))
            .expect("spawn");
        let err = worker
            .handshake(Instant::now() + Duration::from_secs(5))
            .expect_err("not a handshake");
        assert!(matches!(err, Error::HandshakeProtocol(_)));
        let _ = worker.kill();
    }

    #[test]
    fn test_handshake_timeout() {
        let worker = ChildWorker::start(sh("sleep 60")).expect("spawn");
        let err = worker
            .handshake(Instant::now() + Duration::from_millis(100))
            .expect_err("no handshake");
        assert!(matches!(err, Error::HandshakeTimeout));
        let _ = worker.kill();
    }

    #[test]
    fn test_kill_preserves_destroyed_state() {
        let worker = ChildWorker::start(sh("sleep 60")).expect("spawn");
        worker.state().set(Status::Destroyed);
        worker.kill().expect("kill");
        assert_eq!(worker.state().value(), Status::Destroyed);
    }
}
