//! CLI argument definitions.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};

use parley::config::DEFAULT_PROGRAM;
use parley::Settings;

/// Parley - run several assistant conversations side by side
#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Maximum number of open sessions
    #[arg(long, default_value_t = 5)]
    pub max_sessions: usize,

    /// Assistant binary to invoke
    #[arg(long, default_value = DEFAULT_PROGRAM)]
    pub program: String,

    /// Extra argument passed to every invocation (repeatable)
    #[arg(long = "arg", allow_hyphen_values = true)]
    pub extra_args: Vec<String>,

    /// Working directory for invocations (defaults to the current directory)
    #[arg(long)]
    pub dir: Option<PathBuf>,

    /// Where the assistant writes its conversation logs
    #[arg(long)]
    pub log_root: Option<PathBuf>,

    /// Do not tail the conversation log
    #[arg(long)]
    pub no_monitor: bool,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Interactive multi-session chat
    Chat {
        /// Name for the first session
        name: Option<String>,
    },

    /// Replay a captured stream-json file and print the resulting timeline
    Probe {
        /// File with one stream event per line
        file: PathBuf,
    },
}

impl Cli {
    /// Engine settings described by the flags.
    pub fn settings(&self) -> Result<Settings> {
        let dir = match &self.dir {
            Some(dir) => dir
                .canonicalize()
                .with_context(|| format!("Invalid directory: {}", dir.display()))?,
            None => std::env::current_dir().context("Failed to get current directory")?,
        };

        let mut settings = Settings::new(dir)
            .program(&self.program)
            .max_sessions(self.max_sessions);
        for arg in &self.extra_args {
            settings = settings.arg(arg);
        }
        if let Some(root) = &self.log_root {
            settings = settings.log_root(root);
        }
        if self.no_monitor {
            settings = settings.without_monitor();
        }
        Ok(settings)
    }
}
