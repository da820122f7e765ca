//! CLI argument parsing
//!
//! Uses clap for argument parsing with derive macros.

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::io;
use std::path::PathBuf;

/// Live dashboard and coordinator for tmux sessions of AI coding agents
#[derive(Parser, Debug)]
#[command(name = "ntm")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// tmux session to watch
    #[arg(short, long, env = "NTM_SESSION", global = true)]
    pub session: Option<String>,

    /// Project directory (default: current directory)
    #[arg(short, long, env = "NTM_PROJECT_DIR", global = true)]
    pub project_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "RUST_LOG", default_value = "info", global = true)]
    pub log_level: String,

    /// Run in debug mode (shows coordinator event log)
    #[arg(short, long, default_value_t = false, global = true)]
    pub debug: bool,

    /// Run one enumerate + capture + detect pass, print a table and exit
    #[arg(long, default_value_t = false)]
    pub once: bool,

    /// Run the coordinator alongside the dashboard even if disabled in config
    #[arg(long, default_value_t = false)]
    pub coordinator: bool,

    /// Tick rate in ticks per second (default: 10.0)
    #[arg(short = 't', long, default_value_t = 10.0, global = true)]
    pub tick_rate: f64,

    /// Frame rate in frames per second (default: 30.0)
    #[arg(short = 'F', long, default_value_t = 30.0, global = true)]
    pub frame_rate: f64,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run only the coordinator loop (no TUI) until Ctrl+C
    Coordinate,

    /// Delete the session's agent registry and agent info
    Teardown,

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    /// Session name, ignoring blank values from the environment
    pub fn session_name(&self) -> Option<String> {
        self.session
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

/// Generate shell completions and print to stdout
pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "ntm", &mut io::stdout());
}
