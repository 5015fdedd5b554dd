//! opencode-pty
//!
//! Starts `opencode` on a fresh PTY and relays this process's stdin/stdout to it.

use std::process::ExitCode;

use clap::Parser;
use tracing::{debug, error, info};

use opencode_pty::app::logging;
use opencode_pty::cli::Cli;

#[cfg(unix)]
fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Fatal error: {}", e);
            eprintln!("opencode-pty: {}", e);
            ExitCode::FAILURE
        },
    }
}

#[cfg(unix)]
fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    use std::fs::File;
    use std::io;
    use std::os::fd::AsFd;

    use opencode_pty::app::Config;
    use opencode_pty::relay::Relay;
    use opencode_pty::signal::Shutdown;

    let config = Config::from_env()?;
    if cli.skip_permissions {
        debug!("--skip-permissions is left to the wrapped tool");
    }

    let shutdown = Shutdown::install()?;

    // Unbuffered handles on the real stdio descriptors
    let stdin = File::from(io::stdin().as_fd().try_clone_to_owned()?);
    let stdout = File::from(io::stdout().as_fd().try_clone_to_owned()?);

    let relay = Relay::start(&config, stdin, stdout)?;
    info!(pid = %relay.child_pid(), command = ?config.command, "Relaying");

    let report = relay.run(&shutdown);
    info!(
        reason = ?report.reason,
        termination = ?report.termination,
        bytes_out = report.bytes_out,
        bytes_in = report.bytes_in,
        "Session ended"
    );

    Ok(())
}

#[cfg(not(unix))]
fn main() -> ExitCode {
    let _ = Cli::parse();
    logging::init();
    error!("Fatal error: unsupported platform");
    eprintln!("opencode-pty: unsupported platform: a POSIX pseudo-terminal facility is required");
    ExitCode::FAILURE
}
