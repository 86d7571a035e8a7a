// Command-line interface definitions for voicetotex
//
// This module is separate so it can be used by both the binary (main.rs)
// and build.rs for generating man pages.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "voicetotex")]
#[command(author, version, about = "Host for the VoiceToTex speech backend")]
#[command(long_about = "
voicetotex runs the VoiceToTex speech backend as a supervised child process
and keeps an authenticated event channel open to it.

On first run it creates a Python environment and installs the backend's
dependencies, which can take several minutes. After that the backend is
restarted automatically if it crashes (up to 3 times).

SETUP:
  1. Run: voicetotex provision --bootstrap (optional, done on first run anyway)
  2. Run: voicetotex (to start the host)

CONTROL:
  Send SIGUSR1 to restart the backend, SIGINT or SIGTERM to stop.
  Use 'voicetotex status' to read the backend status from the state file.
")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<std::path::PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (errors only)
    #[arg(short, long)]
    pub quiet: bool,

    /// Override the backend directory (contains server.py and requirements.txt)
    #[arg(long, value_name = "DIR")]
    pub backend_dir: Option<std::path::PathBuf>,

    /// Use this Python interpreter for the backend
    #[arg(long, value_name = "PATH")]
    pub python: Option<std::path::PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Supervise the backend and connect to it (default if no command specified)
    Run {
        /// Send this action once the event channel first opens (e.g. get_history)
        #[arg(long, value_name = "ACTION")]
        command: Option<String>,
    },

    /// Show how the backend would be launched, optionally bootstrapping its runtime
    Provision {
        /// Create the Python environment and install dependencies if missing
        #[arg(long)]
        bootstrap: bool,
    },

    /// Show backend status (for Waybar/polybar integration)
    Status {
        /// Output format: "text" (default) or "json" (for Waybar)
        #[arg(long, default_value = "text")]
        format: String,
    },

    /// Show current configuration
    Config,
}
