//! Command-line interface definitions.

use clap::{Parser, Subcommand};

/// Keeps translated subtitle sidecars in sync with a media library.
#[derive(Parser, Debug)]
#[command(name = "babelarr", version, about, long_about = None)]
pub struct Cli {
    /// Increase logging verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    /// Returns the log level based on verbosity flags.
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the daemon: watch, scan, and translate. This is the default.
    Run,

    /// Display the resolved configuration.
    #[command(name = "config-show")]
    ConfigShow,

    /// List all persisted sidecar queue records.
    #[command(name = "queue-list")]
    QueueList,

    /// Clear the persisted sidecar queue.
    #[command(name = "queue-clear")]
    QueueClear,
}
