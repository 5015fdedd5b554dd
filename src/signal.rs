//! Shutdown requests
//!
//! SIGINT, SIGTERM and SIGHUP delivered to the relay are not errors: they
//! ask the relay to stop the child and exit cleanly. The handler only records
//! the signal number; the relay loop picks it up at the top of an iteration.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use nix::libc;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::pty::{PtyError, PtyResult};

/// Signals that end the relay
pub const SHUTDOWN_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP];

/// Last shutdown signal delivered to this process, 0 if none
static DELIVERED: AtomicI32 = AtomicI32::new(0);

extern "C" fn record_signal(signal: libc::c_int) {
    DELIVERED.store(signal, Ordering::SeqCst);
}

/// Handle the relay loop polls to find out whether it should stop
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    requested: Arc<AtomicI32>,
    process_signals: bool,
}

impl Shutdown {
    /// A handle that is only triggered through [`Shutdown::request`]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install handlers for [`SHUTDOWN_SIGNALS`] and return a handle that
    /// reports them.
    ///
    /// No `SA_RESTART`: a signal arriving during `poll` wakes the loop.
    pub fn install() -> PtyResult<Self> {
        let action = SigAction::new(
            SigHandler::Handler(record_signal),
            SaFlags::empty(),
            SigSet::empty(),
        );

        for signal in SHUTDOWN_SIGNALS {
            // SAFETY: the handler only performs an atomic store
            unsafe { sigaction(signal, &action) }
                .map_err(|source| PtyError::SignalHandler { signal, source })?;
        }

        Ok(Self {
            requested: Arc::new(AtomicI32::new(0)),
            process_signals: true,
        })
    }

    /// Ask the relay to stop as if `signal` had been delivered
    pub fn request(&self, signal: Signal) {
        self.requested.store(signal as i32, Ordering::SeqCst);
    }

    /// The signal that asked for shutdown, if any
    pub fn requested(&self) -> Option<Signal> {
        let mut raw = self.requested.load(Ordering::SeqCst);
        if raw == 0 && self.process_signals {
            raw = DELIVERED.load(Ordering::SeqCst);
        }
        if raw == 0 {
            return None;
        }
        Signal::try_from(raw).ok()
    }
}
