//! Log discovery and the bounded content cache.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, trace};
use walkdir::WalkDir;

/// Result of reading a file through the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedRead {
    /// Modification time matches the cached copy; nothing was read.
    Unchanged,
    /// The file was (re)read.
    Fresh(String),
}

#[derive(Debug)]
struct CachedFile {
    content: String,
    modified: SystemTime,
}

/// Path to (content, modification time), oldest entry evicted first.
#[derive(Debug)]
pub struct ContentCache {
    capacity: usize,
    entries: HashMap<PathBuf, CachedFile>,
    order: VecDeque<PathBuf>,
    retries: u32,
    retry_interval: Duration,
}

impl ContentCache {
    pub fn new(capacity: usize, retries: u32, retry_interval: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
            retries: retries.max(1),
            retry_interval,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    /// Cached content for a path, if any.
    pub fn content(&self, path: &Path) -> Option<&str> {
        self.entries.get(path).map(|file| file.content.as_str())
    }

    /// Read `path` unless its modification time is unchanged.
    ///
    /// Each attempt that fails is retried after the configured interval;
    /// the last error is returned once the attempts are used up.
    pub async fn read(&mut self, path: &Path) -> io::Result<CachedRead> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_read(path).await {
                Ok(read) => return Ok(read),
                Err(err) if attempt < self.retries => {
                    trace!(path = %path.display(), attempt, %err, "log read failed, retrying");
                    tokio::time::sleep(self.retry_interval).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_read(&mut self, path: &Path) -> io::Result<CachedRead> {
        let modified = tokio::fs::metadata(path).await?.modified()?;
        if self
            .entries
            .get(path)
            .is_some_and(|cached| cached.modified == modified)
        {
            return Ok(CachedRead::Unchanged);
        }

        let content = tokio::fs::read_to_string(path).await?;
        self.insert(path.to_path_buf(), content.clone(), modified);
        Ok(CachedRead::Fresh(content))
    }

    fn insert(&mut self, path: PathBuf, content: String, modified: SystemTime) {
        if self
            .entries
            .insert(path.clone(), CachedFile { content, modified })
            .is_none()
        {
            self.order.push_back(path);
        }

        while self.entries.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            debug!(path = %oldest.display(), "evicting cached log");
            self.entries.remove(&oldest);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

/// Most recently modified `*.jsonl` file anywhere under `root`.
///
/// Unreadable entries are skipped.
pub fn locate_latest_log(root: &Path) -> Option<PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.path().extension().and_then(|ext| ext.to_str()) == Some("jsonl"))
        .filter_map(|entry| {
            let modified = entry.metadata().ok()?.modified().ok()?;
            Some((modified, entry.into_path()))
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, path)| path)
}
