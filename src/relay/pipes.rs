//! Pipe-backed relay implementation.
//!
//! Frames are JSON-serialized, newline-delimited, and shipped over the
//! worker's stdio pipes with EINTR handling on every fd operation.

use std::io::{self, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::time::Instant;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use super::{Frame, RecvOutcome, Relay};
use crate::error::Result;

/// Read chunk size for the receive buffer.
const READ_CHUNK: usize = 8 * 1024;

/// Upper bound for a single poll(2) round, milliseconds. Long deadlines are
/// served by re-polling so the deadline check stays responsive.
const MAX_POLL_MS: u64 = 60_000;

/// A file descriptor wrapper that implements Read/Write with EINTR handling.
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    /// Create from an owned file descriptor.
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Create from a raw file descriptor (takes ownership).
    ///
    /// # Safety
    /// The caller must ensure `fd` is a valid file descriptor that can be owned.
    pub unsafe fn from_raw(fd: RawFd) -> Self {
        Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        }
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for PipeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(self.fd.as_raw_fd(), buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue, // Retry on interrupt
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::write(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue, // Retry on interrupt
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(()) // Pipes don't need flushing at the fd level
    }
}

/// Line-framed JSON relay over a pipe pair.
pub struct PipeRelay {
    reader: PipeFd,
    writer: PipeFd,
    /// Bytes received but not yet consumed as a complete line.
    buf: Vec<u8>,
}

impl PipeRelay {
    /// Create a relay from the read end and write end of a pipe pair.
    pub fn new(reader: PipeFd, writer: PipeFd) -> Self {
        Self {
            reader,
            writer,
            buf: Vec::with_capacity(READ_CHUNK),
        }
    }

    /// Pull the next newline-terminated frame out of the buffer, if any.
    fn take_buffered_frame(&mut self) -> Result<Option<Frame>> {
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop(); // trailing \n
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.is_empty() {
                continue;
            }
            let frame: Frame = serde_json::from_slice(&line)?;
            return Ok(Some(frame));
        }
        Ok(None)
    }

    /// Wait until the read end is readable or the deadline passes.
    /// Returns false when the deadline elapsed.
    fn poll_readable(&self, deadline: Instant) -> Result<bool> {
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let remaining_ms = deadline
                .duration_since(now)
                .as_millis()
                .clamp(1, u128::from(MAX_POLL_MS)) as u16;

            let mut fds = [PollFd::new(self.reader.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(remaining_ms)) {
                Ok(0) => continue, // re-check the deadline
                Ok(_) => return Ok(true),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32).into()),
            }
        }
    }

    fn read_frame(&mut self, deadline: Option<Instant>) -> Result<RecvOutcome> {
        loop {
            if let Some(frame) = self.take_buffered_frame()? {
                return Ok(RecvOutcome::Frame(frame));
            }

            if let Some(deadline) = deadline {
                if !self.poll_readable(deadline)? {
                    return Ok(RecvOutcome::TimedOut);
                }
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.reader.read(&mut chunk)?;
            if n == 0 {
                return Ok(RecvOutcome::Closed);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

impl Relay for PipeRelay {
    fn send(&mut self, frame: &Frame) -> Result<()> {
        let mut line = serde_json::to_vec(frame)?;
        line.push(b'\n');
        self.writer.write_all(&line)?;
        Ok(())
    }

    fn recv(&mut self) -> Result<RecvOutcome> {
        self.read_frame(None)
    }

    fn recv_deadline(&mut self, deadline: Instant) -> Result<RecvOutcome> {
        self.read_frame(Some(deadline))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Build two relays wired back to back over a pair of pipes.
    fn relay_pair() -> (PipeRelay, PipeRelay) {
        let (a_read, b_write) = nix::unistd::pipe().expect("pipe");
        let (b_read, a_write) = nix::unistd::pipe().expect("pipe");
        (
            PipeRelay::new(PipeFd::new(a_read), PipeFd::new(a_write)),
            PipeRelay::new(PipeFd::new(b_read), PipeFd::new(b_write)),
        )
    }

    #[test]
    fn test_frame_roundtrip() {
        let (mut a, mut b) = relay_pair();

        let frame = Frame::new(b"ctx".to_vec(), vec![0u8, 10, 255]);
        b.send(&frame).unwrap();

        match a.recv().unwrap() {
            RecvOutcome::Frame(got) => assert_eq!(got, frame),
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn test_multiple_frames_in_one_read() {
        let (mut a, mut b) = relay_pair();

        b.send(&Frame::new("one", "")).unwrap();
        b.send(&Frame::new("two", "")).unwrap();

        let first = match a.recv().unwrap() {
            RecvOutcome::Frame(f) => f,
            other => panic!("expected frame, got {:?}", other),
        };
        let second = match a.recv().unwrap() {
            RecvOutcome::Frame(f) => f,
            other => panic!("expected frame, got {:?}", other),
        };
        assert_eq!(first.context, b"one");
        assert_eq!(second.context, b"two");
    }

    #[test]
    fn test_recv_deadline_times_out() {
        let (mut a, _b) = relay_pair();

        let start = Instant::now();
        let outcome = a
            .recv_deadline(Instant::now() + Duration::from_millis(50))
            .unwrap();
        assert!(matches!(outcome, RecvOutcome::TimedOut));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_recv_sees_eof() {
        let (mut a, b) = relay_pair();
        drop(b); // close the write end

        assert!(matches!(a.recv().unwrap(), RecvOutcome::Closed));
    }

    #[test]
    fn test_garbage_line_is_decode_error() {
        let (mut a, mut b) = relay_pair();

        b.writer.write_all(b"not json\n").unwrap();
        assert!(a.recv().is_err());
    }
}
