//! Child-side loop for the bundled worker binary.
//!
//! This runs inside the `stoker-worker` process. It handshakes on stdout,
//! then serves one reply per request frame until the parent sends the stop
//! frame or closes the pipe. The request body is interpreted as a small
//! command language so tests can script worker behavior:
//!
//! - `echo:<text>` - reply with `<text>`
//! - `sleep:<ms>` - sleep, then reply `slept`
//! - `fail:<msg>` - reply with a job-error frame carrying `<msg>`
//! - `crash` - exit immediately without replying
//! - anything else - echo the body back unchanged

use std::time::Duration;

use crate::error::Result;
use crate::payload::STOP_REQUEST;
use crate::relay::{Frame, PipeFd, PipeRelay, RecvOutcome, Relay};

/// Exit code used by the scripted `crash` command.
const CRASH_EXIT_CODE: i32 = 3;

/// Scripted behavior knobs for the worker process.
#[derive(Debug, Clone, Default)]
pub struct WorkerBehavior {
    /// Reply with the stop request on the n-th job, then exit.
    pub stop_after: Option<u64>,
    /// Never send the readiness handshake (fault injection).
    pub skip_handshake: bool,
    /// Delay the handshake (fault injection).
    pub handshake_delay: Option<Duration>,
}

/// Run the worker loop over stdin/stdout and exit the process.
pub fn run_worker(behavior: WorkerBehavior) -> ! {
    // Pipe errors surface through io results, not SIGPIPE.
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    // Safety: file descriptors 0 and 1 are always valid for stdin/stdout.
    let stdin = unsafe { PipeFd::from_raw(0) };
    let stdout = unsafe { PipeFd::from_raw(1) };
    let mut relay = PipeRelay::new(stdin, stdout);

    match worker_loop(&mut relay, &behavior) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("worker error: {}", e);
            std::process::exit(1);
        }
    }
}

fn worker_loop(relay: &mut PipeRelay, behavior: &WorkerBehavior) -> Result<()> {
    if let Some(delay) = behavior.handshake_delay {
        std::thread::sleep(delay);
    }
    if behavior.skip_handshake {
        // Sit silently until the parent gives up and kills us.
        loop {
            match relay.recv()? {
                RecvOutcome::Frame(_) => continue,
                _ => return Ok(()),
            }
        }
    }
    relay.send(&Frame::handshake())?;

    let mut served = 0u64;
    loop {
        let request = match relay.recv()? {
            RecvOutcome::Frame(frame) => frame,
            // Parent closed the pipe; we are done.
            RecvOutcome::Closed => return Ok(()),
            RecvOutcome::TimedOut => unreachable!("recv without a deadline"),
        };

        if request.body.is_empty() && request.context == STOP_REQUEST {
            // Soft termination from the parent; no reply expected.
            return Ok(());
        }

        served += 1;
        if behavior.stop_after == Some(served) {
            // Ask to be retired: deliver the stop request and exit.
            relay.send(&Frame::new(STOP_REQUEST, Vec::new()))?;
            return Ok(());
        }

        relay.send(&respond(&request))?;
    }
}

/// Interpret one request body and build the reply frame.
fn respond(request: &Frame) -> Frame {
    let body = String::from_utf8_lossy(&request.body);

    if let Some(rest) = body.strip_prefix("echo:") {
        return Frame::new(request.context.clone(), rest.as_bytes().to_vec());
    }
    if let Some(rest) = body.strip_prefix("sleep:") {
        let ms: u64 = rest.trim().parse().unwrap_or(0);
        std::thread::sleep(Duration::from_millis(ms));
        return Frame::new(request.context.clone(), b"slept".to_vec());
    }
    if let Some(rest) = body.strip_prefix("fail:") {
        return Frame::job_error(rest.as_bytes().to_vec());
    }
    if body.as_ref() == "crash" {
        std::process::exit(CRASH_EXIT_CODE);
    }

    Frame::new(request.context.clone(), request.body.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_respond_echo() {
        let reply = respond(&Frame::new("ctx", "echo:hello"));
        assert_eq!(reply.body, b"hello");
        assert_eq!(reply.context, b"ctx");
        assert!(!reply.is_error());
    }

    #[test]
    fn test_respond_fail_sets_error_flag() {
        let reply = respond(&Frame::new("", "fail:went sideways"));
        assert!(reply.is_error());
        assert_eq!(reply.body, b"went sideways");
    }

    #[test]
    fn test_respond_default_echoes_body() {
        let reply = respond(&Frame::new("", "just bytes"));
        assert_eq!(reply.body, b"just bytes");
    }

    #[test]
    fn test_respond_sleep_replies_slept() {
        let start = std::time::Instant::now();
        let reply = respond(&Frame::new("", "sleep:20"));
        assert_eq!(reply.body, b"slept");
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
