//! Tails the assistant's on-disk conversation log.
//!
//! The log is written by the assistant itself and is the ground truth for a
//! turn, but it lags or races the live stream. The monitor runs beside the
//! runner without synchronizing with it and publishes what it finds with
//! [`Source::Log`].

mod cache;
mod tail;

pub use cache::{locate_latest_log, CachedRead, ContentCache};
pub use tail::TailReader;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, info_span, trace, Instrument};

use crate::config::Settings;
use crate::diagnostics::Diagnostics;
use crate::error::{Error, Result};
use crate::events::{EventBus, PoolEvent, Source};
use crate::timeline::Update;

#[derive(Debug, Clone, Copy)]
enum Command {
    Changed,
    Prime,
}

/// Background log tail for one session.
///
/// Dropping the monitor stops its task, which releases the file watcher and
/// the content cache.
#[derive(Debug)]
pub struct LogTailMonitor {
    root: PathBuf,
    commands: mpsc::UnboundedSender<Command>,
    rereads: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl LogTailMonitor {
    /// Start watching the settings' log root on behalf of `session_id`.
    ///
    /// Only entries stamped after this call are surfaced as new responses.
    /// A root that does not exist yet is not created: its nearest existing
    /// ancestor is watched until the root appears.
    pub fn start(
        session_id: impl Into<String>,
        settings: &Settings,
        bus: EventBus,
        diagnostics: Diagnostics,
    ) -> Result<Self> {
        let session_id = session_id.into();
        let root = settings.resolved_log_root().ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "no home directory to locate conversation logs",
            ))
        })?;
        let (target, mode) = watch_target(&root).ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no existing directory above {}", root.display()),
            ))
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let changes = tx.clone();
        let filter_root = root.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if is_log_change(&event, &filter_root) => {
                let _ = changes.send(Command::Changed);
            }
            Ok(_) => {}
            Err(err) => debug!(%err, "log watcher error"),
        })
        .map_err(|source| Error::Watch {
            path: root.clone(),
            source,
        })?;
        watcher.watch(&target, mode).map_err(|source| Error::Watch {
            path: target.clone(),
            source,
        })?;

        if target == root {
            info!(session = %session_id, root = %root.display(), "log monitor started");
            diagnostics.record(&session_id, format!("watching {}", root.display()));
        } else {
            info!(
                session = %session_id,
                root = %root.display(),
                waiting_on = %target.display(),
                "log root missing, waiting for it"
            );
            diagnostics.record(
                &session_id,
                format!("{} missing, watching {}", root.display(), target.display()),
            );
        }

        let rereads = Arc::new(AtomicU64::new(0));

        let span = info_span!("log_monitor", session = %session_id);
        let worker = Worker {
            debounce: settings.debounce,
            cache: ContentCache::new(
                settings.cache_capacity,
                settings.read_retries,
                settings.read_retry_interval,
            ),
            reader: TailReader::new(Utc::now()),
            root: root.clone(),
            watcher,
            watched: target,
            rereads: Arc::clone(&rereads),
            session_id,
            bus,
            diagnostics,
        };
        let task = tokio::spawn(worker.run(rx).instrument(span));

        Ok(Self {
            root,
            commands: tx,
            rereads,
            task,
        })
    }

    /// Directory being watched.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// How many times a changed log has been read from disk.
    pub fn rereads(&self) -> u64 {
        self.rereads.load(Ordering::Relaxed)
    }

    /// Re-read the tail now and republish the latest usage as `processing`.
    ///
    /// Call right after a message is sent: a `completed` reading on disk at
    /// that point belongs to the previous turn.
    pub fn prime(&self) {
        let _ = self.commands.send(Command::Prime);
    }

    /// Stop monitoring.
    pub fn dispose(self) {
        debug!(root = %self.root.display(), "log monitor disposed");
    }
}

impl Drop for LogTailMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A log under `root` changed, or a directory on the way to `root` appeared.
fn is_log_change(event: &Event, root: &Path) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event.paths.iter().any(|path| {
            (path.starts_with(root) && path.extension().is_some_and(|ext| ext == "jsonl"))
                || root.starts_with(path)
        })
}

/// The root itself when it exists, otherwise its nearest existing ancestor
/// watched one level deep.
fn watch_target(root: &Path) -> Option<(PathBuf, RecursiveMode)> {
    if root.is_dir() {
        return Some((root.to_path_buf(), RecursiveMode::Recursive));
    }
    root.ancestors()
        .skip(1)
        .find(|dir| dir.is_dir())
        .map(|dir| (dir.to_path_buf(), RecursiveMode::NonRecursive))
}

struct Worker {
    session_id: String,
    root: PathBuf,
    watcher: RecommendedWatcher,
    watched: PathBuf,
    rereads: Arc<AtomicU64>,
    debounce: Duration,
    cache: ContentCache,
    reader: TailReader,
    bus: EventBus,
    diagnostics: Diagnostics,
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Changed) => {
                        if self.watched != self.root {
                            self.rearm();
                        }
                        deadline = Some(Instant::now() + self.debounce);
                    }
                    Some(Command::Prime) => {
                        deadline = None;
                        self.flush(true).await;
                    }
                    None => break,
                },
                () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    deadline = None;
                    self.flush(false).await;
                }
            }
        }

        self.cache.clear();
        debug!("log monitor stopped");
    }

    /// Move the watch closer to the root once more of its path exists.
    fn rearm(&mut self) {
        let Some((target, mode)) = watch_target(&self.root) else {
            return;
        };
        if target == self.watched {
            return;
        }
        if let Err(err) = self.watcher.watch(&target, mode) {
            debug!(path = %target.display(), %err, "could not move log watch");
            return;
        }
        if let Err(err) = self.watcher.unwatch(&self.watched) {
            trace!(path = %self.watched.display(), %err, "unwatch failed");
        }
        debug!(path = %target.display(), "log watch moved");
        if target == self.root {
            self.diagnostics
                .record(&self.session_id, format!("watching {}", self.root.display()));
        }
        self.watched = target;
    }

    /// Shared by the debounce timer and `prime`.
    async fn flush(&mut self, prime: bool) {
        let root = self.root.clone();
        let latest = tokio::task::spawn_blocking(move || locate_latest_log(&root))
            .await
            .ok()
            .flatten();

        match latest {
            Some(path) => match self.cache.read(&path).await {
                Ok(CachedRead::Fresh(content)) => {
                    self.rereads.fetch_add(1, Ordering::Relaxed);
                    let updates = self.reader.ingest(&path, &content);
                    trace!(path = %path.display(), updates = updates.len(), "log reread");
                    self.publish(updates);
                }
                Ok(CachedRead::Unchanged) => {
                    trace!(path = %path.display(), "log unchanged");
                }
                Err(err) => {
                    debug!(path = %path.display(), %err, "log read failed, skipping this cycle");
                    self.diagnostics.record(
                        &self.session_id,
                        format!("log read failed for {}: {err}", path.display()),
                    );
                }
            },
            None => trace!(root = %self.root.display(), "no conversation log yet"),
        }

        if prime {
            if let Some(info) = self.reader.prime() {
                self.publish(vec![Update::Service(info)]);
            }
        }
    }

    fn publish(&self, updates: Vec<Update>) {
        for update in updates {
            let session_id = self.session_id.clone();
            self.bus.emit(match update {
                Update::Message(message) => PoolEvent::MessageReceived {
                    session_id,
                    source: Source::Log,
                    message,
                },
                Update::Service(info) => PoolEvent::ServiceInfoReceived {
                    session_id,
                    source: Source::Log,
                    info,
                },
            });
        }
    }
}
