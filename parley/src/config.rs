//! Engine settings.
//!
//! There is no configuration file; the binary fills these from its command
//! line and library users construct them directly.

use std::path::PathBuf;
use std::time::Duration;

/// Default assistant binary.
pub const DEFAULT_PROGRAM: &str = "claude";

/// Tunables for the pool, its runners and its monitors.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Maximum number of concurrently open sessions.
    pub max_sessions: usize,
    /// Assistant binary to invoke.
    pub program: String,
    /// Extra arguments placed before the fixed streaming flags.
    pub extra_args: Vec<String>,
    /// Working directory every invocation runs in.
    pub working_dir: PathBuf,
    /// Directory searched for the assistant's conversation logs.
    /// `None` derives it from `working_dir`.
    pub log_root: Option<PathBuf>,
    /// Whether sessions attach a log tail monitor.
    pub monitor_logs: bool,
    /// Delay coalescing bursts of log change notifications.
    pub debounce: Duration,
    /// Number of files kept in the monitor's content cache.
    pub cache_capacity: usize,
    /// Attempts per log read before giving up for that cycle.
    pub read_retries: u32,
    /// Pause between log read attempts.
    pub read_retry_interval: Duration,
    /// Tool results longer than this many lines are elided.
    pub result_max_lines: usize,
    /// Tool results are cut at this many characters.
    pub result_max_chars: usize,
    /// Timeline length kept per session; older messages are dropped.
    pub history_limit: usize,
    /// Lines retained by the diagnostics sink.
    pub diagnostics_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_sessions: 5,
            program: DEFAULT_PROGRAM.to_string(),
            extra_args: Vec::new(),
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            log_root: None,
            monitor_logs: true,
            debounce: Duration::from_millis(200),
            cache_capacity: 10,
            read_retries: 3,
            read_retry_interval: Duration::from_millis(50),
            result_max_lines: 10,
            result_max_chars: 2000,
            history_limit: 1000,
            diagnostics_capacity: 200,
        }
    }
}

impl Settings {
    /// Settings rooted at the given working directory.
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            ..Self::default()
        }
    }

    /// Set the assistant binary.
    #[must_use]
    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Add an extra invocation argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    /// Set the pool capacity.
    #[must_use]
    pub const fn max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    /// Use an explicit log root.
    #[must_use]
    pub fn log_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.log_root = Some(root.into());
        self
    }

    /// Disable log tail monitoring.
    #[must_use]
    pub const fn without_monitor(mut self) -> Self {
        self.monitor_logs = false;
        self
    }

    /// Directory holding this working directory's conversation logs.
    ///
    /// The assistant stores them under `~/.claude/projects/<slug>` where the
    /// slug is the absolute working directory with every non-alphanumeric
    /// character replaced by `-`.
    pub fn resolved_log_root(&self) -> Option<PathBuf> {
        if let Some(root) = &self.log_root {
            return Some(root.clone());
        }
        let home = dirs::home_dir()?;
        Some(
            home.join(".claude")
                .join("projects")
                .join(project_slug(&self.working_dir)),
        )
    }
}

/// Directory name the assistant uses for a project path.
pub fn project_slug(path: &std::path::Path) -> String {
    let absolute = path
        .canonicalize()
        .unwrap_or_else(|_| path.to_path_buf());
    absolute
        .to_string_lossy()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}
