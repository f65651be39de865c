//! One subprocess per outbound message.
//!
//! Runs the assistant CLI like:
//! `claude [extra args] -p --output-format stream-json --verbose [--resume <token>]`
//! with the message on stdin, and turns its stdout into [`ProtocolEvent`]s.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::diagnostics::Diagnostics;
use crate::error::{Error, Result};
use crate::protocol::{LineBuffer, ProtocolEvent, ResultEvent};

static CONTEXT_LIMIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)prompt is too long|context (window|length|limit)|maximum context|too many tokens")
        .expect("valid regex")
});

const READ_CHUNK: usize = 8192;

/// What a finished invocation reported.
#[derive(Debug, Clone)]
pub struct InvocationOutcome {
    pub exit_code: Option<i32>,
    /// Terminal `result` event, if the stream contained one.
    pub result: Option<ResultEvent>,
    /// Captured stderr text.
    pub stderr: String,
    /// Number of events forwarded.
    pub events: usize,
}

/// Cloneable control handle for a runner's in-flight process.
#[derive(Debug, Clone, Default)]
pub struct RunnerHandle {
    inner: Arc<HandleState>,
}

#[derive(Debug, Default)]
struct HandleState {
    pid: AtomicU32,
    terminated: AtomicBool,
    kill: Notify,
}

impl RunnerHandle {
    /// Whether a process is currently running.
    pub fn is_running(&self) -> bool {
        self.inner.pid.load(Ordering::SeqCst) != 0
    }

    /// Kill the in-flight process and its process group, if any.
    ///
    /// Termination is sticky: an invocation that starts afterwards is killed
    /// as soon as its process exists.
    pub fn terminate(&self) {
        self.inner.terminated.store(true, Ordering::SeqCst);
        let pid = self.inner.pid.load(Ordering::SeqCst);
        if pid == 0 {
            return;
        }
        signal_group(pid);
        self.inner.kill.notify_one();
    }

    fn was_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }
}

fn signal_group(pid: u32) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Ok(raw) = i32::try_from(pid) {
            if let Err(err) = killpg(Pid::from_raw(raw), Signal::SIGTERM) {
                debug!(pid, %err, "killpg failed");
            }
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

/// Spawns invocations for one session and owns its resume token.
#[derive(Debug)]
pub struct InvocationRunner {
    scope: String,
    program: String,
    extra_args: Vec<String>,
    working_dir: PathBuf,
    resume_token: Option<String>,
    diagnostics: Diagnostics,
    handle: RunnerHandle,
}

impl InvocationRunner {
    /// Runner for a session; `scope` labels its logs and diagnostics.
    pub fn new(scope: impl Into<String>, settings: &Settings, diagnostics: Diagnostics) -> Self {
        Self {
            scope: scope.into(),
            program: settings.program.clone(),
            extra_args: settings.extra_args.clone(),
            working_dir: settings.working_dir.clone(),
            resume_token: None,
            diagnostics,
            handle: RunnerHandle::default(),
        }
    }

    pub fn handle(&self) -> RunnerHandle {
        self.handle.clone()
    }

    pub fn resume_token(&self) -> Option<&str> {
        self.resume_token.as_deref()
    }

    /// Arguments for the next invocation.
    pub fn args(&self) -> Vec<String> {
        let mut args = self.extra_args.clone();
        args.extend(
            ["-p", "--output-format", "stream-json", "--verbose"]
                .into_iter()
                .map(String::from),
        );
        if let Some(token) = &self.resume_token {
            args.push("--resume".to_string());
            args.push(token.clone());
        }
        args
    }

    /// Run one invocation, forwarding every parsed event to `events`.
    ///
    /// Returns once the process has exited. Events keep flowing even if the
    /// receiver is gone; they are simply dropped.
    pub async fn invoke(
        &mut self,
        input: &str,
        events: mpsc::UnboundedSender<ProtocolEvent>,
    ) -> Result<InvocationOutcome> {
        let args = self.args();
        let resuming = self.resume_token.is_some();

        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| {
            self.diagnostics
                .record(&self.scope, format!("spawn of {} failed: {source}", self.program));
            Error::Spawn {
                program: self.program.clone(),
                source,
            }
        })?;

        let pid = child.id().unwrap_or_default();
        self.handle.inner.pid.store(pid, Ordering::SeqCst);
        if self.handle.was_terminated() {
            // terminate() ran before the pid was visible to it.
            debug!(session = %self.scope, pid, "terminated before start");
            signal_group(pid);
            let _ = child.start_kill();
            let status = child.wait().await;
            self.handle.inner.pid.store(0, Ordering::SeqCst);
            return Err(Error::Process {
                code: status?.code(),
                stderr: "terminated".to_string(),
            });
        }
        info!(session = %self.scope, pid, resuming, "invocation started");
        self.diagnostics
            .record(&self.scope, format!("spawned pid {pid} (resume: {resuming})"));

        let mut stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let mut stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let mut stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

        let payload = input.to_owned();
        let writer = tokio::spawn(async move {
            stdin.write_all(payload.as_bytes()).await?;
            stdin.shutdown().await
        });

        let scope = self.scope.clone();
        let stderr_reader = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Err(err) = stderr.read_to_end(&mut buf).await {
                debug!(session = %scope, %err, "stderr read failed");
            }
            String::from_utf8_lossy(&buf).trim().to_string()
        });

        let mut lines = LineBuffer::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        let mut last_result = None;
        let mut forwarded = 0usize;

        loop {
            tokio::select! {
                read = stdout.read(&mut chunk) => {
                    let n = match read {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(err) => {
                            warn!(session = %self.scope, %err, "error reading stdout");
                            break;
                        }
                    };
                    for line in lines.push(&chunk[..n]) {
                        forwarded += self.forward_line(&line, &events, &mut last_result);
                    }
                }
                () = self.handle.inner.kill.notified() => {
                    debug!(session = %self.scope, "terminating invocation");
                    let _ = child.start_kill();
                }
            }
        }
        if let Some(line) = lines.finish() {
            forwarded += self.forward_line(&line, &events, &mut last_result);
        }

        let status = child.wait().await;
        self.handle.inner.pid.store(0, Ordering::SeqCst);
        let status = status?;

        match writer.await {
            Ok(Err(err)) => debug!(session = %self.scope, %err, "stdin write failed"),
            Err(err) => debug!(session = %self.scope, %err, "stdin writer task failed"),
            Ok(Ok(())) => {}
        }
        let stderr = stderr_reader.await.unwrap_or_default();

        let exit_code = status.code();
        info!(session = %self.scope, ?exit_code, forwarded, "invocation finished");
        self.diagnostics.record(
            &self.scope,
            format!("pid {pid} exited ({exit_code:?}), {forwarded} events"),
        );
        if !stderr.is_empty() {
            debug!(session = %self.scope, %stderr, "invocation stderr");
        }

        if self.handle.was_terminated() {
            return Err(Error::Process {
                code: exit_code,
                stderr: "terminated".to_string(),
            });
        }

        let reported = last_result
            .as_ref()
            .filter(|r: &&ResultEvent| r.is_error)
            .and_then(|r| r.result.clone());
        if !status.success() || reported.is_some() {
            let detail = reported.clone().unwrap_or_else(|| stderr.clone());
            if CONTEXT_LIMIT.is_match(&stderr) || reported.as_deref().is_some_and(|r| CONTEXT_LIMIT.is_match(r)) {
                self.diagnostics.record(&self.scope, "context limit reached");
                return Err(Error::ContextLimit(detail));
            }
        }
        if !status.success() {
            self.diagnostics
                .record(&self.scope, format!("failed: {}", first_line(&stderr)));
            return Err(Error::Process {
                code: exit_code,
                stderr,
            });
        }

        Ok(InvocationOutcome {
            exit_code,
            result: last_result,
            stderr,
            events: forwarded,
        })
    }

    fn forward_line(
        &mut self,
        line: &str,
        events: &mpsc::UnboundedSender<ProtocolEvent>,
        last_result: &mut Option<ResultEvent>,
    ) -> usize {
        let event = match ProtocolEvent::parse(line) {
            Ok(Some(event)) => event,
            Ok(None) => return 0,
            Err(err) => {
                debug!(
                    session = %self.scope,
                    %err,
                    line = %preview(line),
                    "skipping unparseable output line"
                );
                return 0;
            }
        };

        if let Some(token) = event.session_id() {
            if self.resume_token.as_deref() != Some(token) {
                debug!(session = %self.scope, token, "stored resume token");
                self.resume_token = Some(token.to_string());
            }
        }
        if let ProtocolEvent::Result(result) = &event {
            *last_result = Some(result.clone());
        }

        let _ = events.send(event);
        1
    }
}

fn missing_pipe(name: &str) -> Error {
    Error::Io(std::io::Error::other(format!("failed to capture {name}")))
}

fn preview(line: &str) -> String {
    line.chars().take(120).collect()
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}
