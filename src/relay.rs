//! The stdin/stdout ⇄ PTY relay
//!
//! A single thread waits on the PTY master and the real stdin with a bounded
//! `poll`, copies master → stdout and stdin → master, and stops when the
//! child goes away, the master hangs up, or a shutdown signal arrives.
//!
//! ```text
//! Starting ──▶ Running ──▶ Draining ──▶ Terminated
//! ```
//!
//! Draining always runs: SIGTERM, a bounded wait, then SIGKILL if needed.
//! Terminated closes the master.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::libc;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tracing::{debug, info, trace, warn};

use crate::app::{Config, RelayConfig};
use crate::pty::{
    set_nonblocking, ChildProcess, NonBlockingGuard, PtyPair, PtyResult, Session, Termination,
};
use crate::signal::Shutdown;

/// Pause before retrying a write that would block
const WRITE_RETRY: Duration = Duration::from_millis(1);

/// Lifecycle of a relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// PTY allocated and child spawned, loop not entered yet
    Starting,
    /// Copying bytes in both directions
    Running,
    /// Stopping the child
    Draining,
    /// Master closed
    Terminated,
}

/// Why the relay loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Zero-length read from the master
    MasterEof,
    /// The master could no longer be read (EIO once the slave side is gone)
    MasterError(io::ErrorKind),
    /// The exit poll found the child gone
    ChildExited,
    /// A shutdown signal was delivered to the relay
    Interrupted(Signal),
    /// Stdout stopped accepting bytes
    OutputClosed,
    /// The multiplexed wait itself failed
    PollFailed(Errno),
}

/// Summary of a finished relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayReport {
    pub reason: StopReason,
    pub termination: Termination,
    /// Bytes copied from the master to the output
    pub bytes_out: u64,
    /// Bytes copied from the input to the master
    pub bytes_in: u64,
}

/// Result of one chunked copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chunk {
    /// This many bytes were read and fully written
    Data(usize),
    /// The reader reported end of stream
    Eof,
    /// Nothing to read right now
    Empty,
}

/// Failure of a chunked copy, split by side
#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    #[error("read failed: {0}")]
    Read(#[source] io::Error),
    #[error("write failed: {0}")]
    Write(#[source] io::Error),
    /// Shutdown was requested while the writer kept refusing bytes
    #[error("write abandoned after {0:?}")]
    Interrupted(Signal),
}

/// Read at most one buffer from `reader` and write all of it to `writer`,
/// flushing afterwards.
pub fn copy_chunk<R, W>(reader: &mut R, writer: &mut W, buf: &mut [u8]) -> Result<Chunk, CopyError>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    copy_with(reader, writer, buf, None)
}

/// Like [`copy_chunk`], but a stalled write gives up once `shutdown` has
/// been requested.
pub fn copy_chunk_until<R, W>(
    reader: &mut R,
    writer: &mut W,
    buf: &mut [u8],
    shutdown: &Shutdown,
) -> Result<Chunk, CopyError>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    copy_with(reader, writer, buf, Some(shutdown))
}

fn copy_with<R, W>(
    reader: &mut R,
    writer: &mut W,
    buf: &mut [u8],
    shutdown: Option<&Shutdown>,
) -> Result<Chunk, CopyError>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let n = loop {
        match reader.read(buf) {
            Ok(0) => return Ok(Chunk::Eof),
            Ok(n) => break n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Chunk::Empty),
            Err(e) => return Err(CopyError::Read(e)),
        }
    };

    write_fully(writer, &buf[..n], shutdown)?;
    Ok(Chunk::Data(n))
}

/// `write_all` + `flush` that rides out EAGAIN and EINTR until `shutdown`
/// is requested.
///
/// Stdout may share its open file description with a tty stdin that was
/// switched to non-blocking mode.
fn write_fully<W: Write + ?Sized>(
    writer: &mut W,
    mut data: &[u8],
    shutdown: Option<&Shutdown>,
) -> Result<(), CopyError> {
    while !data.is_empty() {
        match writer.write(data) {
            Ok(0) => return Err(CopyError::Write(io::ErrorKind::WriteZero.into())),
            Ok(n) => data = &data[n..],
            Err(e) => retry_write(e, shutdown)?,
        }
    }

    loop {
        match writer.flush() {
            Ok(()) => return Ok(()),
            Err(e) => retry_write(e, shutdown)?,
        }
    }
}

/// `Ok` when a failed write or flush should be attempted again
fn retry_write(error: io::Error, shutdown: Option<&Shutdown>) -> Result<(), CopyError> {
    let kind = error.kind();
    if kind != io::ErrorKind::Interrupted && kind != io::ErrorKind::WouldBlock {
        return Err(CopyError::Write(error));
    }
    if let Some(signal) = shutdown.and_then(Shutdown::requested) {
        return Err(CopyError::Interrupted(signal));
    }
    if kind == io::ErrorKind::WouldBlock {
        thread::sleep(WRITE_RETRY);
    }
    Ok(())
}

/// Which descriptors `poll` reported
#[derive(Debug, Default)]
struct Ready {
    master_readable: bool,
    master_writable: bool,
    input_readable: bool,
    input_invalid: bool,
}

/// Relays bytes between `input`/`output` and a child running on a PTY
pub struct Relay<I, O> {
    master: File,
    child: ChildProcess,
    // Declared before `input` so the flags are restored while its fd is open
    input_mode: NonBlockingGuard,
    input: I,
    output: O,
    config: RelayConfig,
    timeout_ms: libc::c_int,
    state: RelayState,
    input_open: bool,
    /// Input bytes the master has not accepted yet
    pending: Vec<u8>,
    bytes_out: u64,
    bytes_in: u64,
}

impl<I, O> Relay<I, O>
where
    I: Read + AsFd,
    O: Write,
{
    /// Allocate a PTY, size it, and spawn `config.command` on it.
    ///
    /// Failing to set the window size is logged and otherwise ignored.
    pub fn start(config: &Config, input: I, output: O) -> PtyResult<Self> {
        let pair = PtyPair::open()?;

        let size = config.window.size();
        if let Err(e) = pair.set_window_size(size) {
            warn!(error = %e, rows = size.rows, cols = size.cols, "Could not set PTY window size");
        }

        let session = pair.spawn(&config.command)?;
        Self::with_session(session, input, output, config.relay)
    }

    /// Wrap an already spawned session.
    ///
    /// Switches the master and `input` to non-blocking mode. If that fails
    /// the child is stopped before the error is returned.
    pub fn with_session(session: Session, input: I, output: O, config: RelayConfig) -> PtyResult<Self> {
        let (master, mut child) = session.into_parts();

        let input_mode = match set_nonblocking(&master).and_then(|_| NonBlockingGuard::new(&input)) {
            Ok(guard) => guard,
            Err(e) => {
                child.terminate(config.terminate_grace());
                return Err(e);
            },
        };

        Ok(Self {
            master,
            child,
            input_mode,
            input,
            output,
            config,
            timeout_ms: libc::c_int::try_from(config.poll_interval_ms).unwrap_or(libc::c_int::MAX),
            state: RelayState::Starting,
            input_open: true,
            pending: Vec::new(),
            bytes_out: 0,
            bytes_in: 0,
        })
    }

    /// Current state. [`Relay::run`] consumes the relay, so from outside
    /// this is always [`RelayState::Starting`]; later states are logged.
    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn child_pid(&self) -> Pid {
        self.child.pid()
    }

    /// Run until the session ends, then stop the child and close the master
    pub fn run(mut self, shutdown: &Shutdown) -> RelayReport {
        self.enter(RelayState::Running);
        let reason = self.relay(shutdown);
        info!(?reason, "Relay loop finished");

        self.enter(RelayState::Draining);
        let termination = self.child.terminate(self.config.terminate_grace());
        info!(?termination, "Child stopped");

        self.enter(RelayState::Terminated);
        let Relay {
            master,
            bytes_out,
            bytes_in,
            input_mode,
            ..
        } = self;
        drop(master);
        drop(input_mode);

        RelayReport {
            reason,
            termination,
            bytes_out,
            bytes_in,
        }
    }

    fn enter(&mut self, state: RelayState) {
        debug!(from = ?self.state, to = ?state, "Relay state change");
        self.state = state;
    }

    fn relay(&mut self, shutdown: &Shutdown) -> StopReason {
        let mut master_buf = vec![0u8; self.config.master_chunk_size];
        let mut input_buf = vec![0u8; self.config.input_chunk_size];

        loop {
            if let Some(signal) = shutdown.requested() {
                info!(?signal, "Shutdown requested");
                return StopReason::Interrupted(signal);
            }

            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!(%status, "Child exited");
                    self.drain_master(&mut master_buf, shutdown);
                    return StopReason::ChildExited;
                },
                Ok(None) => {},
                Err(e) => debug!(error = %e, "Could not poll child status"),
            }

            let ready = match self.wait_ready() {
                Ok(ready) => ready,
                Err(errno) => {
                    warn!(error = %errno, "poll failed");
                    return StopReason::PollFailed(errno);
                },
            };

            if ready.master_readable {
                if let Some(reason) = self.copy_master(&mut master_buf, shutdown) {
                    return reason;
                }
            }

            if ready.master_writable {
                self.flush_pending();
            }

            if ready.input_invalid {
                debug!("Input descriptor invalid, no longer reading it");
                self.input_open = false;
            } else if ready.input_readable {
                self.read_input(&mut input_buf);
            }
        }
    }

    /// Bounded wait for the master and, unless input is backed up, stdin
    fn wait_ready(&self) -> Result<Ready, Errno> {
        let mut master_events = PollFlags::POLLIN;
        if !self.pending.is_empty() {
            master_events |= PollFlags::POLLOUT;
        }
        let watch_input = self.input_open && self.pending.is_empty();

        let mut fds = Vec::with_capacity(2);
        fds.push(PollFd::new(&self.master, master_events));
        if watch_input {
            fds.push(PollFd::new(&self.input, PollFlags::POLLIN));
        }

        match poll(&mut fds, self.timeout_ms) {
            Ok(0) => Ok(Ready::default()),
            Ok(_) => {
                let master = fds[0].revents().unwrap_or(PollFlags::empty());
                if master.contains(PollFlags::POLLNVAL) {
                    return Err(Errno::EBADF);
                }
                let input = if watch_input {
                    fds[1].revents().unwrap_or(PollFlags::empty())
                } else {
                    PollFlags::empty()
                };
                let readable = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;

                Ok(Ready {
                    master_readable: master.intersects(readable),
                    master_writable: master.contains(PollFlags::POLLOUT),
                    input_readable: input.intersects(readable),
                    input_invalid: input.contains(PollFlags::POLLNVAL),
                })
            },
            // A signal landed during the wait; the loop re-checks shutdown
            Err(Errno::EINTR) => Ok(Ready::default()),
            Err(e) => Err(e),
        }
    }

    /// One master → output copy; `Some` ends the loop
    fn copy_master(&mut self, buf: &mut [u8], shutdown: &Shutdown) -> Option<StopReason> {
        match copy_chunk_until(&mut self.master, &mut self.output, buf, shutdown) {
            Ok(Chunk::Data(n)) => {
                trace!(bytes = n, "master -> output");
                self.bytes_out += n as u64;
                None
            },
            Ok(Chunk::Empty) => None,
            Ok(Chunk::Eof) => {
                debug!("EOF on PTY master");
                Some(StopReason::MasterEof)
            },
            Err(CopyError::Read(e)) => {
                if e.raw_os_error() == Some(libc::EIO) {
                    debug!("PTY slave side closed");
                } else {
                    warn!(error = %e, "Read from PTY master failed");
                }
                Some(StopReason::MasterError(e.kind()))
            },
            Err(CopyError::Write(e)) => {
                warn!(error = %e, "Output closed");
                Some(StopReason::OutputClosed)
            },
            Err(CopyError::Interrupted(signal)) => {
                info!(?signal, "Shutdown requested while output was stalled");
                Some(StopReason::Interrupted(signal))
            },
        }
    }

    /// Pick up output the child wrote just before exiting.
    ///
    /// Stops at hangup, or once the master stays quiet for a poll interval.
    fn drain_master(&mut self, buf: &mut [u8], shutdown: &Shutdown) {
        let deadline = Instant::now() + self.config.poll_interval();

        while Instant::now() < deadline {
            let mut fds = [PollFd::new(&self.master, PollFlags::POLLIN)];
            match poll(&mut fds, self.timeout_ms) {
                Ok(0) => return,
                Ok(_) => {},
                Err(Errno::EINTR) => continue,
                Err(_) => return,
            }

            match copy_chunk_until(&mut self.master, &mut self.output, buf, shutdown) {
                Ok(Chunk::Data(n)) => self.bytes_out += n as u64,
                Ok(Chunk::Empty) => {},
                Ok(Chunk::Eof) | Err(_) => return,
            }
        }
    }

    fn read_input(&mut self, buf: &mut [u8]) {
        match self.input.read(buf) {
            Ok(0) => {
                debug!("Input reached EOF, no longer reading it");
                self.input_open = false;
            },
            Ok(n) => {
                trace!(bytes = n, "input -> master");
                self.pending.extend_from_slice(&buf[..n]);
                self.flush_pending();
            },
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) => {},
            // Poll keeps reporting a descriptor in this state as ready
            Err(e) => {
                warn!(error = %e, fd = self.input.as_fd().as_raw_fd(), "Input failed, no longer reading it");
                self.input_open = false;
            },
        }
    }

    /// Hand pending input to the master until it would block
    fn flush_pending(&mut self) {
        while !self.pending.is_empty() {
            match self.master.write(&self.pending) {
                Ok(0) => break,
                Ok(n) => {
                    self.pending.drain(..n);
                    self.bytes_in += n as u64;
                },
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, dropped = self.pending.len(), "Write to PTY master failed");
                    self.pending.clear();
                },
            }
        }
    }
}
