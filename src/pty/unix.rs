//! Unix PTY implementation
//!
//! Implements PTY creation and child process management using POSIX APIs:
//! - posix_openpt() to open the master
//! - grantpt() / unlockpt() to prepare the slave
//! - ptsname() to find the slave device path
//!
//! The slave is opened in the parent so the window size can be set on it
//! before spawn. It is then moved into the child's stdio and dropped, which
//! leaves the master as the only PTY descriptor the parent holds.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::libc;
use nix::pty::{grantpt, posix_openpt, unlockpt, PtyMaster};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{setsid, Pid};
use tracing::{debug, warn};

use super::{PtyError, PtyResult, Termination, WindowSize};

/// How often the child is polled while waiting out the termination grace period
const REAP_INTERVAL: Duration = Duration::from_millis(10);

/// A freshly allocated master/slave pair, before anything is spawned on it
pub struct PtyPair {
    master: File,
    slave: File,
    slave_path: PathBuf,
}

impl PtyPair {
    /// Allocate a new PTY pair
    pub fn open() -> PtyResult<Self> {
        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).map_err(PtyError::OpenMaster)?;
        grantpt(&master).map_err(PtyError::GrantPty)?;
        unlockpt(&master).map_err(PtyError::UnlockPty)?;
        let slave_name = slave_name(&master)?;

        // SAFETY: into_raw_fd hands over sole ownership of an open descriptor
        let master = unsafe { File::from_raw_fd(master.into_raw_fd()) };
        fcntl(master.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
            .map_err(PtyError::CloseOnExec)?;

        // O_NOCTTY: the relay must not adopt the PTY as its own controlling terminal
        let slave = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(&slave_name)
            .map_err(|source| PtyError::OpenSlave {
                path: slave_name.clone(),
                source,
            })?;

        debug!(slave = %slave_name, "Allocated PTY pair");

        Ok(Self {
            master,
            slave,
            slave_path: PathBuf::from(slave_name),
        })
    }

    /// Set the window size on the slave side
    pub fn set_window_size(&self, size: WindowSize) -> PtyResult<()> {
        set_window_size(self.slave.as_raw_fd(), size)
    }

    /// Path of the slave device (e.g. `/dev/pts/3`)
    pub fn slave_path(&self) -> &Path {
        &self.slave_path
    }

    /// Spawn `command` with the slave as its controlling terminal and stdio.
    ///
    /// The child becomes the leader of a new session. Every slave descriptor
    /// the parent held is closed before this returns, on success and on error.
    pub fn spawn(self, command: &[String]) -> PtyResult<Session> {
        let PtyPair {
            master,
            slave,
            slave_path,
        } = self;

        let (program, args) = command.split_first().ok_or(PtyError::EmptyCommand)?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::from(slave.try_clone()?))
            .stdout(Stdio::from(slave.try_clone()?))
            .stderr(Stdio::from(slave));

        if std::env::var_os("TERM").is_none() {
            cmd.env("TERM", "xterm-256color");
        }

        // SAFETY: the hook runs between fork and exec and only makes
        // async-signal-safe calls (setsid, ioctl)
        unsafe {
            cmd.pre_exec(|| {
                setsid().map_err(io::Error::from)?;
                // stdin is the slave by now
                if libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY as _, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let spawned = cmd.spawn();
        // Releases the slave copies owned by `cmd`
        drop(cmd);

        let child = spawned.map_err(|source| PtyError::Spawn {
            program: program.clone(),
            source,
        })?;

        debug!(pid = child.id(), program = %program, "Spawned child on PTY");

        Ok(Session {
            master,
            child: ChildProcess { inner: child },
            slave_path,
        })
    }
}

/// A child running on the slave side of a PTY, plus the master end
pub struct Session {
    master: File,
    child: ChildProcess,
    slave_path: PathBuf,
}

impl Session {
    /// Get the PTY master
    pub fn master(&self) -> &File {
        &self.master
    }

    /// Get the child process
    pub fn child(&mut self) -> &mut ChildProcess {
        &mut self.child
    }

    /// Path of the slave device the child runs on
    pub fn slave_path(&self) -> &Path {
        &self.slave_path
    }

    /// Split into the master end and the child handle
    pub fn into_parts(self) -> (File, ChildProcess) {
        (self.master, self.child)
    }
}

/// Handle on the spawned child process
pub struct ChildProcess {
    inner: Child,
}

impl ChildProcess {
    /// Get the child process ID
    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.inner.id() as libc::pid_t)
    }

    /// Check whether the child has exited, reaping it if so
    pub fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        self.inner.try_wait()
    }

    /// Stop the child: SIGTERM, wait up to `grace`, then SIGKILL.
    ///
    /// Does nothing beyond reaping if the child has already exited.
    pub fn terminate(&mut self, grace: Duration) -> Termination {
        let pid = self.pid();

        match self.inner.try_wait() {
            Ok(Some(status)) => return Termination::AlreadyExited(status),
            Ok(None) => {},
            Err(e) => {
                warn!(%pid, error = %e, "Failed to check child status");
                return Termination::Unknown;
            },
        }

        debug!(%pid, "Sending SIGTERM to child");
        if let Err(e) = kill(pid, Signal::SIGTERM) {
            debug!(%pid, error = %e, "SIGTERM failed");
        }

        let deadline = Instant::now() + grace;
        loop {
            match self.inner.try_wait() {
                Ok(Some(status)) => return Termination::Graceful(status),
                Ok(None) if Instant::now() >= deadline => break,
                Ok(None) => thread::sleep(REAP_INTERVAL),
                Err(e) => {
                    warn!(%pid, error = %e, "Failed to wait for child");
                    return Termination::Unknown;
                },
            }
        }

        warn!(%pid, grace_ms = grace.as_millis() as u64, "Child still running, sending SIGKILL");
        if let Err(e) = self.inner.kill() {
            warn!(%pid, error = %e, "SIGKILL failed");
        }

        match self.inner.wait() {
            Ok(status) => Termination::Killed(status),
            Err(e) => {
                warn!(%pid, error = %e, "Failed to reap child");
                Termination::Unknown
            },
        }
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        // Try to reap the child process
        let _ = self.inner.try_wait();
    }
}

/// Restores a descriptor's original status flags when dropped
pub struct NonBlockingGuard {
    fd: RawFd,
    original: OFlag,
}

impl NonBlockingGuard {
    /// Switch `fd` to non-blocking mode, remembering the previous flags
    pub fn new<Fd: AsFd>(fd: &Fd) -> PtyResult<Self> {
        let raw = fd.as_fd().as_raw_fd();
        let original = set_nonblocking(fd)?;
        Ok(Self { fd: raw, original })
    }
}

impl Drop for NonBlockingGuard {
    fn drop(&mut self) {
        let _ = fcntl(self.fd, FcntlArg::F_SETFL(self.original));
    }
}

/// Put a descriptor into non-blocking mode, returning its previous flags
pub fn set_nonblocking<Fd: AsFd>(fd: &Fd) -> PtyResult<OFlag> {
    let raw = fd.as_fd().as_raw_fd();
    let flags = fcntl(raw, FcntlArg::F_GETFL).map_err(PtyError::SetNonBlocking)?;
    let flags = OFlag::from_bits_truncate(flags);
    fcntl(raw, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).map_err(PtyError::SetNonBlocking)?;
    Ok(flags)
}

/// Set the window size on a PTY file descriptor
pub fn set_window_size(fd: RawFd, size: WindowSize) -> PtyResult<()> {
    let winsize = libc::winsize {
        ws_row: size.rows,
        ws_col: size.cols,
        ws_xpixel: size.pixel_width,
        ws_ypixel: size.pixel_height,
    };

    // SAFETY: TIOCSWINSZ reads a winsize struct that outlives the call
    let result = unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, &winsize) };

    if result < 0 {
        Err(PtyError::SetWinsize(nix::errno::Errno::last()))
    } else {
        Ok(())
    }
}

/// Get the window size from a PTY file descriptor
pub fn get_window_size(fd: RawFd) -> PtyResult<WindowSize> {
    let mut winsize = libc::winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    // SAFETY: TIOCGWINSZ writes into a winsize struct we own
    let result = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut winsize) };

    if result < 0 {
        Err(PtyError::GetWinsize(nix::errno::Errno::last()))
    } else {
        Ok(WindowSize {
            rows: winsize.ws_row,
            cols: winsize.ws_col,
            pixel_width: winsize.ws_xpixel,
            pixel_height: winsize.ws_ypixel,
        })
    }
}

#[cfg(target_os = "linux")]
fn slave_name(master: &PtyMaster) -> PtyResult<String> {
    nix::pty::ptsname_r(master).map_err(PtyError::PtsName)
}

#[cfg(not(target_os = "linux"))]
fn slave_name(master: &PtyMaster) -> PtyResult<String> {
    // SAFETY: ptsname uses a static buffer; the name is copied out immediately
    unsafe { nix::pty::ptsname(master) }.map_err(PtyError::PtsName)
}
