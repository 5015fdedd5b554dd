//! Command line arguments

use clap::Parser;

/// Run opencode inside a pseudo-terminal and relay stdin/stdout to it
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "opencode-pty", version, about)]
pub struct Cli {
    /// Accepted for the wrapped tool; does not change how the relay behaves
    #[arg(long)]
    pub skip_permissions: bool,
}
