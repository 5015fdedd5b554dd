//! opencode-pty
//!
//! Runs an interactive command-line tool inside a pseudo-terminal and relays
//! the invoking process's stdin/stdout to it, so the tool behaves as if it
//! were started from an interactive shell even when spawned as a subprocess.
//!
//! - `pty`: PTY allocation, child spawning and termination
//! - `relay`: the poll loop copying bytes between stdin/stdout and the PTY
//! - `signal`: turning SIGINT/SIGTERM/SIGHUP into a clean shutdown
//! - `app`: configuration and logging
//! - `cli`: command line flags

pub mod app;
pub mod cli;
pub mod pty;
#[cfg(unix)]
pub mod relay;
#[cfg(unix)]
pub mod signal;
