//! PTY (Pseudoterminal) handling
//!
//! Allocation of the master/slave pair, spawning the wrapped command on the
//! slave, and tearing the child down again.

use std::process::ExitStatus;

#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub use unix::{
    get_window_size, set_nonblocking, set_window_size, ChildProcess, NonBlockingGuard, PtyPair,
    Session,
};

/// Error type for PTY operations
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    #[error("Failed to open PTY master: {0}")]
    OpenMaster(#[source] nix::Error),

    #[error("Failed to grant PTY access: {0}")]
    GrantPty(#[source] nix::Error),

    #[error("Failed to unlock PTY: {0}")]
    UnlockPty(#[source] nix::Error),

    #[error("Failed to get PTY slave name: {0}")]
    PtsName(#[source] nix::Error),

    #[error("Failed to open PTY slave {path}: {source}")]
    OpenSlave {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to set close-on-exec on PTY master: {0}")]
    CloseOnExec(#[source] nix::Error),

    #[error("Failed to set window size: {0}")]
    SetWinsize(#[source] nix::Error),

    #[error("Failed to get window size: {0}")]
    GetWinsize(#[source] nix::Error),

    #[error("Failed to set non-blocking mode: {0}")]
    SetNonBlocking(#[source] nix::Error),

    #[error("No command to spawn")]
    EmptyCommand,

    #[error("Failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to install handler for {signal}: {source}")]
    SignalHandler {
        signal: nix::sys::signal::Signal,
        #[source]
        source: nix::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for PTY operations
pub type PtyResult<T> = Result<T, PtyError>;

/// Window size for PTY
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
    pub pixel_width: u16,
    pub pixel_height: u16,
}

impl WindowSize {
    /// Create a new window size with just rows and columns
    pub fn new(rows: u16, cols: u16) -> Self {
        Self {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self::new(30, 120)
    }
}

/// How the child ended up being stopped during shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The child was already gone when shutdown began
    AlreadyExited(ExitStatus),
    /// The child exited after SIGTERM, within the grace period
    Graceful(ExitStatus),
    /// The grace period ran out and the child was SIGKILLed
    Killed(ExitStatus),
    /// The child could not be reaped
    Unknown,
}

impl Termination {
    pub fn status(&self) -> Option<ExitStatus> {
        match self {
            Termination::AlreadyExited(status)
            | Termination::Graceful(status)
            | Termination::Killed(status) => Some(*status),
            Termination::Unknown => None,
        }
    }

    /// Whether a termination signal had to be sent
    pub fn was_signaled(&self) -> bool {
        matches!(self, Termination::Graceful(_) | Termination::Killed(_))
    }
}
