//! Integration tests for the relay
//!
//! These run real children on real PTYs. Input comes from a socket pair
//! standing in for stdin; output is captured in a Vec standing in for stdout.

use std::fs::File;
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use nix::fcntl::{fcntl, FcntlArg};
use nix::libc;
use nix::sys::signal::{kill, Signal};
use opencode_pty::app::{Config, RelayConfig};
use opencode_pty::pty::{set_window_size, PtyPair, Termination, WindowSize};
use opencode_pty::relay::{Relay, RelayState, StopReason};
use opencode_pty::signal::Shutdown;

fn sh_config(script: &str) -> Config {
    Config {
        command: vec!["/bin/sh".into(), "-c".into(), script.into()],
        relay: RelayConfig {
            terminate_grace_ms: 200,
            ..RelayConfig::default()
        },
        ..Config::default()
    }
}

fn session_ended(reason: StopReason) -> bool {
    matches!(
        reason,
        StopReason::ChildExited | StopReason::MasterEof | StopReason::MasterError(_)
    )
}

// ============================================================================
// Output direction
// ============================================================================

#[test]
fn test_child_output_reaches_stdout_verbatim() {
    let (input, _keep_open) = UnixStream::pair().unwrap();
    let mut output = Vec::new();

    let relay = Relay::start(&sh_config("printf 'ready> '"), &input, &mut output)
        .expect("Failed to start relay");
    assert_eq!(relay.state(), RelayState::Starting);

    let report = relay.run(&Shutdown::new());

    assert_eq!(output, b"ready> ");
    assert_eq!(report.bytes_out, 7);
    assert_eq!(report.bytes_in, 0);
    assert!(session_ended(report.reason), "{:?}", report.reason);
}

#[test]
fn test_large_output_survives_chunking() {
    let (input, _keep_open) = UnixStream::pair().unwrap();
    let mut output = Vec::new();

    // 20000 'x' bytes, no newlines, so the line discipline leaves them alone
    let relay = Relay::start(
        &sh_config("i=0; while [ $i -lt 200 ]; do printf '%0100d' 0 | tr 0 x; i=$((i+1)); done"),
        &input,
        &mut output,
    )
    .unwrap();
    let report = relay.run(&Shutdown::new());

    assert_eq!(output.len(), 20000);
    assert!(output.iter().all(|&b| b == b'x'));
    assert_eq!(report.bytes_out, 20000);
}

#[test]
fn test_child_sees_default_window_size() {
    let (input, _keep_open) = UnixStream::pair().unwrap();
    let mut output = Vec::new();

    Relay::start(&sh_config("stty size"), &input, &mut output)
        .unwrap()
        .run(&Shutdown::new());

    assert_eq!(String::from_utf8_lossy(&output).trim(), "30 120");
}

// ============================================================================
// Input direction
// ============================================================================

#[test]
fn test_stdin_bytes_reach_child_unmodified() {
    let capture = tempfile::NamedTempFile::new().unwrap();
    let mut config = sh_config("head -c 3 > \"$0\"");
    config.command.push(capture.path().to_string_lossy().into_owned());

    let (input, mut user) = UnixStream::pair().unwrap();
    user.write_all(b"ls\n").unwrap();

    let mut output = Vec::new();
    let report = Relay::start(&config, &input, &mut output)
        .unwrap()
        .run(&Shutdown::new());

    assert_eq!(std::fs::read(capture.path()).unwrap(), b"ls\n");
    assert_eq!(report.bytes_in, 3);
    // The line discipline echoes what was typed
    assert!(String::from_utf8_lossy(&output).contains("ls"));
}

#[test]
fn test_stdin_eof_does_not_end_session() {
    let (input, user) = UnixStream::pair().unwrap();
    drop(user);

    let mut output = Vec::new();
    let report = Relay::start(&sh_config("sleep 0.3; printf done"), &input, &mut output)
        .unwrap()
        .run(&Shutdown::new());

    assert_eq!(output, b"done");
    assert!(session_ended(report.reason), "{:?}", report.reason);
}

/// CPU time consumed by the calling thread
#[cfg(target_os = "linux")]
fn thread_cpu_time() -> Duration {
    // SAFETY: getrusage only writes into the struct we pass
    let usage = unsafe {
        let mut usage: libc::rusage = std::mem::zeroed();
        assert_eq!(libc::getrusage(libc::RUSAGE_THREAD, &mut usage), 0);
        usage
    };
    let micros = |t: libc::timeval| t.tv_sec as u64 * 1_000_000 + t.tv_usec as u64;
    Duration::from_micros(micros(usage.ru_utime) + micros(usage.ru_stime))
}

#[cfg(target_os = "linux")]
#[test]
fn test_failing_input_is_dropped_without_spinning() {
    // Poll always reports a directory readable, and reading it fails
    let dir = tempfile::tempdir().unwrap();
    let input = File::open(dir.path()).unwrap();

    let mut output = Vec::new();
    let relay = Relay::start(&sh_config("sleep 0.5; printf done"), &input, &mut output).unwrap();

    let cpu_before = thread_cpu_time();
    let report = relay.run(&Shutdown::new());
    let cpu_used = thread_cpu_time() - cpu_before;

    assert_eq!(output, b"done");
    assert!(session_ended(report.reason), "{:?}", report.reason);
    assert!(cpu_used < Duration::from_millis(200), "relay used {:?} of CPU", cpu_used);
}

#[test]
fn test_input_blocking_mode_restored() {
    let (input, _user) = UnixStream::pair().unwrap();
    let before = fcntl(input.as_raw_fd(), FcntlArg::F_GETFL).unwrap();

    let mut output = Vec::new();
    Relay::start(&sh_config("true"), &input, &mut output)
        .unwrap()
        .run(&Shutdown::new());

    assert_eq!(fcntl(input.as_raw_fd(), FcntlArg::F_GETFL).unwrap(), before);
}

// ============================================================================
// Shutdown
// ============================================================================

#[test]
fn test_child_exit_ends_relay_promptly() {
    let (input, _keep_open) = UnixStream::pair().unwrap();
    let mut output = Vec::new();

    let relay = Relay::start(&sh_config("exit 3"), &input, &mut output).unwrap();
    let started = Instant::now();
    let report = relay.run(&Shutdown::new());

    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(session_ended(report.reason), "{:?}", report.reason);
    assert!(!matches!(report.termination, Termination::Killed(_)));
}

#[test]
fn test_interrupt_stops_child_gracefully() {
    let (input, _keep_open) = UnixStream::pair().unwrap();
    let mut output = Vec::new();
    let shutdown = Shutdown::new();

    let relay = Relay::start(&sh_config("sleep 5"), &input, &mut output).unwrap();

    let trigger = shutdown.clone();
    let interrupter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        trigger.request(Signal::SIGINT);
    });

    let report = relay.run(&shutdown);
    interrupter.join().unwrap();

    assert_eq!(report.reason, StopReason::Interrupted(Signal::SIGINT));
    assert!(matches!(report.termination, Termination::Graceful(_)), "{:?}", report.termination);
}

#[test]
fn test_master_hangup_stops_live_child() {
    let (input, _keep_open) = UnixStream::pair().unwrap();
    let mut output = Vec::new();

    // The child lets go of the slave but keeps running
    let relay = Relay::start(
        &sh_config("exec </dev/null >/dev/null 2>&1; sleep 5"),
        &input,
        &mut output,
    )
    .unwrap();

    let started = Instant::now();
    let report = relay.run(&Shutdown::new());

    assert!(
        matches!(report.reason, StopReason::MasterEof | StopReason::MasterError(_)),
        "{:?}",
        report.reason
    );
    assert!(matches!(report.termination, Termination::Graceful(_)), "{:?}", report.termination);
    assert!(started.elapsed() < Duration::from_secs(2));
}

/// Output whose every write is cut short by a signal, like a pipe the
/// reader stopped draining
struct StalledOutput;

impl Write for StalledOutput {
    fn write(&mut self, _: &[u8]) -> io::Result<usize> {
        Err(io::ErrorKind::Interrupted.into())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_interrupt_while_output_stalled() {
    let shutdown = Shutdown::new();
    let (done_tx, done_rx) = mpsc::channel();

    let handle = shutdown.clone();
    let worker = thread::spawn(move || {
        let (input, _keep_open) = UnixStream::pair().unwrap();
        let relay = Relay::start(&sh_config("printf x; sleep 30"), input, StalledOutput).unwrap();
        let report = relay.run(&handle);
        let _ = done_tx.send(report);
    });

    thread::sleep(Duration::from_millis(300));
    shutdown.request(Signal::SIGINT);

    let report = done_rx
        .recv_timeout(Duration::from_secs(3))
        .expect("Relay did not stop while output was stalled");
    worker.join().unwrap();

    assert_eq!(report.reason, StopReason::Interrupted(Signal::SIGINT));
    assert!(matches!(report.termination, Termination::Graceful(_)), "{:?}", report.termination);
    assert_eq!(report.bytes_out, 0);
}

#[test]
fn test_stubborn_child_is_killed() {
    let (input, _keep_open) = UnixStream::pair().unwrap();
    let mut output = Vec::new();
    let shutdown = Shutdown::new();

    let relay = Relay::start(
        &sh_config("trap '' TERM; while :; do sleep 1; done"),
        &input,
        &mut output,
    )
    .unwrap();

    let trigger = shutdown.clone();
    let interrupter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        trigger.request(Signal::SIGTERM);
    });

    let started = Instant::now();
    let report = relay.run(&shutdown);
    interrupter.join().unwrap();

    assert_eq!(report.reason, StopReason::Interrupted(Signal::SIGTERM));
    assert!(matches!(report.termination, Termination::Killed(_)), "{:?}", report.termination);
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[test]
fn test_interrupt_before_run_skips_loop() {
    let (input, _keep_open) = UnixStream::pair().unwrap();
    let mut output = Vec::new();
    let shutdown = Shutdown::new();
    shutdown.request(Signal::SIGHUP);

    let report = Relay::start(&sh_config("sleep 5"), &input, &mut output)
        .unwrap()
        .run(&shutdown);

    assert_eq!(report.reason, StopReason::Interrupted(Signal::SIGHUP));
    assert!(report.termination.was_signaled());
}

#[test]
fn test_externally_killed_child_is_detected() {
    let (input, _keep_open) = UnixStream::pair().unwrap();
    let mut output = Vec::new();

    let relay = Relay::start(&sh_config("sleep 5"), &input, &mut output).unwrap();
    let pid = relay.child_pid();

    let killer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        kill(pid, Signal::SIGKILL).unwrap();
    });

    let started = Instant::now();
    let report = relay.run(&Shutdown::new());
    killer.join().unwrap();

    assert!(session_ended(report.reason), "{:?}", report.reason);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!matches!(report.termination, Termination::Killed(_) | Termination::Unknown));
}

// ============================================================================
// Setup
// ============================================================================

#[test]
fn test_window_size_failure_is_not_fatal() {
    // An invalid descriptor makes TIOCSWINSZ fail
    assert!(set_window_size(-1, WindowSize::default()).is_err());

    let pair = PtyPair::open().unwrap();
    let session = pair
        .spawn(&sh_config("printf ok").command)
        .expect("Spawn must not depend on the window size");

    let (input, _keep_open) = UnixStream::pair().unwrap();
    let mut output = Vec::new();
    let relay = Relay::with_session(session, &input, &mut output, RelayConfig::default()).unwrap();
    let report = relay.run(&Shutdown::new());

    assert_eq!(output, b"ok");
    assert!(session_ended(report.reason), "{:?}", report.reason);
}

#[test]
fn test_spawn_failure_is_reported() {
    let (input, _keep_open) = UnixStream::pair().unwrap();
    let mut output = Vec::new();
    let config = Config {
        command: vec!["/nonexistent/opencode".into()],
        ..Config::default()
    };

    let err = Relay::start(&config, &input, &mut output).err().expect("Start should fail");
    assert!(err.to_string().contains("/nonexistent/opencode"));
}
