//! Self-expiring scratch directory store.
//!
//! Every staged asset lives in its own uniquely named directory below a
//! single root. Each directory gets exactly one deletion timer when it is
//! created. Timers only live in memory, so on startup the store rebuilds
//! them from each directory's on-disk birth time: directories whose lifetime
//! already elapsed are removed immediately, the others are scheduled for
//! their remaining lifetime.
//!
//! ```text
//! root/
//!   3f0c…-…/            <- ResourceEntry, removed at created_at + ttl
//!     video.mp4
//!     video.mp4.yolo.mp4
//!   a91d…-…/
//! ```

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::fs;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::StoreConfig;

/// Errors that can occur in the scratch store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Refusing to remove {} outside of the store root", .0.display())]
    OutOfScope(PathBuf),

    #[error("Failed to read metadata of {}: {source}", .path.display())]
    RecoveryPartialFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A tracked scratch directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceEntry {
    /// Directory name below the root
    pub id: String,

    /// Absolute directory path
    pub path: PathBuf,

    pub created_at: DateTime<Utc>,

    /// Always `created_at + ttl`
    pub expires_at: DateTime<Utc>,
}

impl ResourceEntry {
    fn new(id: String, path: PathBuf, created: SystemTime, ttl: Duration) -> Self {
        Self {
            id,
            path,
            created_at: DateTime::<Utc>::from(created),
            expires_at: DateTime::<Utc>::from(created + ttl),
        }
    }

    /// Lifetime left at `now`, `None` once the entry has expired.
    fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        (self.expires_at - now)
            .to_std()
            .ok()
            .filter(|remaining| !remaining.is_zero())
    }
}

/// Outcome of a startup recovery scan.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Entries still alive, now tracked with a timer for their remaining lifetime
    pub scheduled: usize,

    /// Entries whose lifetime had already elapsed and were removed
    pub removed: usize,

    /// Entries that vanished while the scan was running
    pub skipped: usize,

    /// Entries that could not be inspected or removed
    pub failures: Vec<StoreError>,
}

struct Timer {
    entry: ResourceEntry,
    handle: JoinHandle<()>,
}

struct StoreInner {
    root: PathBuf,
    ttl: Duration,
    timers: Mutex<HashMap<String, Timer>>,
    shutdown: CancellationToken,
}

/// Scratch directory store with automatic expiry.
///
/// Cloning is cheap and every clone shares the same timer set. Separate
/// instances are fully independent, even when pointed at the same root.
#[derive(Clone)]
pub struct ResourceStore {
    inner: Arc<StoreInner>,
}

impl ResourceStore {
    /// Create a store for `root`. No I/O happens until [`start`](Self::start)
    /// or [`create`](Self::create).
    pub fn new(root: impl Into<PathBuf>, ttl: Duration) -> Self {
        let root = root.into();
        let root = std::path::absolute(&root).unwrap_or(root);

        Self {
            inner: Arc::new(StoreInner {
                root: normalize_lexically(&root),
                ttl,
                timers: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.root.clone(), config.ttl())
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// Prepare the root and rebuild timers for whatever a previous process
    /// left behind.
    pub async fn start(&self) -> Result<RecoveryReport, StoreError> {
        fs::create_dir_all(&self.inner.root)
            .await
            .map_err(|e| StoreError::io(&self.inner.root, e))?;

        self.recover().await
    }

    /// Allocate a new scratch directory and schedule its removal.
    #[instrument(skip(self), fields(root = %self.inner.root.display()))]
    pub async fn create(&self) -> Result<PathBuf, StoreError> {
        let root = &self.inner.root;
        fs::create_dir_all(root)
            .await
            .map_err(|e| StoreError::io(root, e))?;

        loop {
            let name = unique_name();
            let dir = root.join(&name);

            match fs::create_dir(&dir).await {
                Ok(()) => {
                    let entry =
                        ResourceEntry::new(name, dir.clone(), SystemTime::now(), self.inner.ttl);
                    debug!(
                        path = %dir.display(),
                        expires_at = %entry.expires_at,
                        "Scratch directory created"
                    );
                    self.schedule(entry, self.inner.ttl);
                    return Ok(dir);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!(name = %name, "Scratch directory name collision, retrying");
                }
                Err(e) => return Err(StoreError::io(&dir, e)),
            }
        }
    }

    /// Remove a scratch directory and everything in it.
    ///
    /// Only paths that resolve strictly below the root are accepted. Removing
    /// a path that is already gone succeeds.
    #[instrument(skip(self, path), fields(path = %path.as_ref().display()))]
    pub async fn remove(&self, path: impl AsRef<Path>) -> Result<(), StoreError> {
        let path = path.as_ref();
        let canonical_root = self.canonical_root().await;
        let target = self.resolve_in_scope(path, &canonical_root).await?;

        let Some(target) = target else {
            if let Some(id) = self.entry_id(&absolute_lexical(path), &canonical_root) {
                self.cancel(&id);
            }
            debug!("Scratch path already removed");
            return Ok(());
        };

        if let Some(id) = self.entry_id(&target, &canonical_root) {
            self.cancel(&id);
        }

        remove_path(&target)
            .await
            .map_err(|e| StoreError::io(&target, e))?;

        debug!("Scratch path removed");
        Ok(())
    }

    /// Rebuild timers from the directories found below the root.
    ///
    /// A failure on one entry never stops the others from being processed;
    /// it is logged and collected in the report instead.
    #[instrument(skip(self), fields(root = %self.inner.root.display()))]
    pub async fn recover(&self) -> Result<RecoveryReport, StoreError> {
        self.scan(|path| async move { fs::symlink_metadata(path).await })
            .await
    }

    /// Recovery scan with a pluggable metadata lookup.
    async fn scan<F, Fut>(&self, inspect: F) -> Result<RecoveryReport, StoreError>
    where
        F: Fn(PathBuf) -> Fut,
        Fut: Future<Output = io::Result<std::fs::Metadata>>,
    {
        let root = &self.inner.root;
        let mut report = RecoveryReport::default();

        let mut dir = match fs::read_dir(root).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(StoreError::io(root, e)),
        };

        loop {
            let item = match dir.next_entry().await {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to list scratch root");
                    report.failures.push(StoreError::io(root, e));
                    break;
                }
            };

            let path = item.path();
            let id = item.file_name().to_string_lossy().into_owned();

            let metadata = match inspect(path.clone()).await {
                Ok(metadata) => metadata,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "Scratch entry vanished during recovery");
                    report.skipped += 1;
                    continue;
                }
                Err(source) => {
                    warn!(path = %path.display(), error = %source, "Failed to read scratch entry metadata");
                    report
                        .failures
                        .push(StoreError::RecoveryPartialFailure { path, source });
                    continue;
                }
            };

            let created = match birth_time(&metadata) {
                Ok(created) => created,
                Err(source) => {
                    warn!(path = %path.display(), error = %source, "Scratch entry has no usable timestamp");
                    report
                        .failures
                        .push(StoreError::RecoveryPartialFailure { path, source });
                    continue;
                }
            };

            let entry = ResourceEntry::new(id, path.clone(), created, self.inner.ttl);

            match entry.remaining(Utc::now()) {
                Some(remaining) => {
                    debug!(
                        path = %path.display(),
                        remaining_secs = remaining.as_secs(),
                        "Rescheduling scratch entry"
                    );
                    self.schedule(entry, remaining);
                    report.scheduled += 1;
                }
                None => match remove_path(&path).await {
                    Ok(true) => report.removed += 1,
                    Ok(false) => report.skipped += 1,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to remove expired scratch entry");
                        report.failures.push(StoreError::io(&path, e));
                    }
                },
            }
        }

        info!(
            scheduled = report.scheduled,
            removed = report.removed,
            skipped = report.skipped,
            failed = report.failures.len(),
            "Scratch store recovered"
        );

        Ok(report)
    }

    /// Cancel all pending timers. Directories stay on disk and are picked up
    /// by the next [`recover`](Self::recover).
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let timers: Vec<Timer> = self.inner.timers.lock().drain().map(|(_, t)| t).collect();
        for timer in &timers {
            timer.handle.abort();
        }

        info!(
            root = %self.inner.root.display(),
            pending = timers.len(),
            "Scratch store shut down"
        );
    }

    /// Snapshot of the tracked entries, oldest first.
    pub fn entries(&self) -> Vec<ResourceEntry> {
        let mut entries: Vec<ResourceEntry> = self
            .inner
            .timers
            .lock()
            .values()
            .map(|timer| timer.entry.clone())
            .collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        entries
    }

    /// Number of tracked entries.
    pub fn len(&self) -> usize {
        self.inner.timers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn schedule(&self, entry: ResourceEntry, delay: Duration) {
        if self.inner.shutdown.is_cancelled() {
            debug!(path = %entry.path.display(), "Store is shut down, not scheduling");
            return;
        }

        let inner = Arc::clone(&self.inner);
        let token = self.inner.shutdown.clone();
        let id = entry.id.clone();

        // The lock is held across the spawn so the timer cannot fire before
        // it is registered.
        let mut timers = self.inner.timers.lock();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => inner.expire(&id).await,
            }
        });

        if let Some(previous) = timers.insert(entry.id.clone(), Timer { entry, handle }) {
            previous.handle.abort();
        }
    }

    fn cancel(&self, id: &str) {
        if let Some(timer) = self.inner.timers.lock().remove(id) {
            timer.handle.abort();
        }
    }

    /// Map a path directly below the root to its entry id.
    fn entry_id(&self, path: &Path, canonical_root: &Path) -> Option<String> {
        let parent = path.parent()?;
        if parent == self.inner.root || parent == canonical_root {
            path.file_name().map(|name| name.to_string_lossy().into_owned())
        } else {
            None
        }
    }

    async fn canonical_root(&self) -> PathBuf {
        fs::canonicalize(&self.inner.root)
            .await
            .unwrap_or_else(|_| self.inner.root.clone())
    }

    /// Resolve `path` against the root.
    ///
    /// Returns the canonical path for existing targets, `None` for targets
    /// that are already gone, and `OutOfScope` for anything not strictly
    /// below the root (symlinks are followed before the check).
    async fn resolve_in_scope(
        &self,
        path: &Path,
        canonical_root: &Path,
    ) -> Result<Option<PathBuf>, StoreError> {
        let root = &self.inner.root;

        let below = |candidate: &Path| {
            (candidate != root.as_path() && candidate.starts_with(root))
                || (candidate != canonical_root && candidate.starts_with(canonical_root))
        };

        match fs::canonicalize(path).await {
            Ok(resolved) => {
                if resolved != canonical_root && resolved.starts_with(canonical_root) {
                    Ok(Some(resolved))
                } else {
                    warn!(resolved = %resolved.display(), "Rejected removal outside the store root");
                    Err(StoreError::OutOfScope(path.to_path_buf()))
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if below(&absolute_lexical(path)) {
                    Ok(None)
                } else {
                    warn!("Rejected removal outside the store root");
                    Err(StoreError::OutOfScope(path.to_path_buf()))
                }
            }
            Err(e) => Err(StoreError::io(path, e)),
        }
    }
}

impl StoreInner {
    /// Timer callback: forget the entry, then delete it.
    async fn expire(&self, id: &str) {
        self.timers.lock().remove(id);
        let path = self.root.join(id);

        match remove_path(&path).await {
            Ok(true) => {
                metrics::counter!("darknode.store.expired").increment(1);
                info!(path = %path.display(), "Expired scratch directory removed");
            }
            Ok(false) => {
                debug!(path = %path.display(), "Expired scratch directory already gone");
            }
            Err(e) => {
                metrics::counter!("darknode.store.expiry_errors").increment(1);
                error!(path = %path.display(), error = %e, "Failed to remove expired scratch directory");
            }
        }
    }
}

/// Generate a fresh lowercase directory name.
pub fn unique_name() -> String {
    Uuid::new_v4().to_string().to_lowercase()
}

/// Creation time of an entry, falling back to the modification time on
/// filesystems that do not record birth time.
fn birth_time(metadata: &std::fs::Metadata) -> io::Result<SystemTime> {
    match metadata.created() {
        Ok(created) => Ok(created),
        Err(e) => {
            debug!(error = %e, "Birth time unavailable, using modification time");
            metadata.modified()
        }
    }
}

/// Delete a file, symlink or directory tree. Returns `false` when nothing
/// was there.
async fn remove_path(path: &Path) -> io::Result<bool> {
    let metadata = match fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };

    let result = if metadata.is_dir() {
        fs::remove_dir_all(path).await
    } else {
        fs::remove_file(path).await
    };

    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn absolute_lexical(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    normalize_lexically(&absolute)
}

/// Resolve `.` and `..` without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
