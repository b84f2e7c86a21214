//! File-level change observation on top of directory-level OS watches.
//!
//! Operating systems watch directories, not files. The observer registers a
//! non-recursive watch on the parent directory of every watched file, keeps
//! `file -> directory` and `directory -> watched-file count` maps, and drops
//! events for files nobody asked about. A directory stays registered exactly
//! as long as at least one watched file lives in it.

use crate::error::ObserverError;
use crate::prelude::*;
use crate::watcher::debouncer::{EventConsumer, EventDebouncer};
use crate::watcher::events::{FileChangeEvent, FileChangeKind};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

/// Resolves the identity under which a file is watched: the canonicalized
/// parent directory joined with the file name. Events from the OS arrive
/// under this identity, and the file itself need not exist (deletions must
/// still resolve).
pub(crate) fn watch_key(path: &Path) -> io::Result<PathBuf> {
    let file_name = path.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path {} has no file name", path.display()),
        )
    })?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    Ok(fs::canonicalize(parent)?.join(file_name))
}

/// Watches a dynamic set of files and delivers coalesced change events to a
/// single consumer.
///
/// Raw OS events flow through an [`EventDebouncer`] configured with the
/// window given at construction, so a burst of events caused by a non-atomic
/// file replacement reaches the consumer as one [`FileChangeEvent`].
///
/// The background task is supervised: if it dies unexpectedly it is restarted
/// once; a second death disables observation (surfaced via logs). `close`
/// stops the task and releases every OS watch handle; dropping the observer
/// does the same.
pub struct FileObserver {
    inner: Arc<Inner>,
}

struct Inner {
    window: Duration,
    cancel: CancellationToken,
    watcher: Mutex<Option<RecommendedWatcher>>,
    raw_rx: Mutex<Option<mpsc::UnboundedReceiver<notify::Event>>>,
    watched_files: Mutex<HashMap<PathBuf, PathBuf>>,
    watched_dirs: Mutex<HashMap<PathBuf, usize>>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl std::fmt::Debug for FileObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let files = self
            .inner
            .watched_files
            .lock()
            .map(|map| map.len())
            .unwrap_or(0);
        f.debug_struct("FileObserver")
            .field("window", &self.inner.window)
            .field("watched_files", &files)
            .field("started", &self.inner.started.load(Ordering::Relaxed))
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl FileObserver {
    /// Creates an observer with the given debounce window.
    ///
    /// # Errors
    ///
    /// Returns [`ObserverError::Watch`] if the OS watch facility cannot be
    /// initialized.
    pub fn new(window: Duration) -> Result<Self, ObserverError> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();

        let watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            match result {
                Ok(event) => {
                    // Receiver gone means the observer is closed; nothing to do.
                    let _ = raw_tx.send(event);
                }
                Err(err) => {
                    warn!("os watch error: {err}");
                }
            }
        })?;

        Ok(Self {
            inner: Arc::new(Inner {
                window,
                cancel: CancellationToken::new(),
                watcher: Mutex::new(Some(watcher)),
                raw_rx: Mutex::new(Some(raw_rx)),
                watched_files: Mutex::new(HashMap::new()),
                watched_dirs: Mutex::new(HashMap::new()),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Adds `path` to the watch set. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the observer is closed, the enclosing directory
    /// cannot be resolved, or the OS rejects the watch registration.
    pub fn watch(&self, path: &Path) -> Result<(), ObserverError> {
        self.inner.assert_open()?;
        let key = watch_key(path)?;
        let directory = key
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));

        let mut files = lock(&self.inner.watched_files);
        if files.contains_key(&key) {
            return Ok(());
        }

        let mut dirs = lock(&self.inner.watched_dirs);
        match dirs.get_mut(&directory) {
            Some(count) => *count += 1,
            None => {
                info!("watching directory {}", directory.display());
                let mut watcher = lock(&self.inner.watcher);
                let watcher = watcher.as_mut().ok_or(ObserverError::Closed)?;
                watcher.watch(&directory, RecursiveMode::NonRecursive)?;
                dirs.insert(directory.clone(), 1);
            }
        }

        info!("watching file {}", path.display());
        files.insert(key, directory);
        Ok(())
    }

    /// Removes `path` from the watch set; the enclosing directory is
    /// unwatched along with its last watched file.
    pub fn unwatch(&self, path: &Path) {
        let Ok(key) = watch_key(path) else {
            return;
        };
        self.unwatch_key(&key);
    }

    pub(crate) fn unwatch_key(&self, key: &Path) {
        let mut files = lock(&self.inner.watched_files);
        let Some(directory) = files.remove(key) else {
            return;
        };
        info!("unwatching file {}", key.display());

        let mut dirs = lock(&self.inner.watched_dirs);
        if let Some(count) = dirs.get_mut(&directory) {
            *count -= 1;
            if *count == 0 {
                dirs.remove(&directory);
                info!("unwatching directory {}", directory.display());
                let mut watcher = lock(&self.inner.watcher);
                if let Some(watcher) = watcher.as_mut() {
                    if let Err(err) = watcher.unwatch(&directory) {
                        debug!("unwatch {} failed: {err}", directory.display());
                    }
                }
            }
        }
    }

    /// Starts the background observation task delivering to `consumer`.
    ///
    /// May be called at most once per observer. Must be called from within a
    /// tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ObserverError::AlreadyStarted`] on a second call, or
    /// [`ObserverError::Closed`] after `close`.
    pub fn start(
        &self,
        consumer: impl Fn(FileChangeEvent) + Send + Sync + 'static,
    ) -> Result<(), ObserverError> {
        self.inner.assert_open()?;
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(ObserverError::AlreadyStarted);
        }

        let raw_rx = lock(&self.inner.raw_rx)
            .take()
            .ok_or(ObserverError::AlreadyStarted)?;
        let raw_rx = Arc::new(AsyncMutex::new(raw_rx));

        let consumer: EventConsumer = Arc::new(consumer);
        let debouncer = Arc::new(EventDebouncer::new(
            self.inner.window,
            consumer,
            self.inner.cancel.child_token(),
        ));

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut restarted = false;
            loop {
                let task_inner = Arc::clone(&inner);
                let task_rx = Arc::clone(&raw_rx);
                let task_debouncer = Arc::clone(&debouncer);
                let handle =
                    tokio::spawn(
                        async move { run_loop(&task_inner, &task_rx, &task_debouncer).await },
                    );

                match handle.await {
                    Ok(()) => break,
                    Err(err) if !restarted => {
                        restarted = true;
                        warn!("file observation task died unexpectedly ({err}); restarting");
                    }
                    Err(err) => {
                        error!("file observation task died again ({err}); files are no longer monitored");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    /// Stops the background task and releases every OS watch handle.
    ///
    /// Buffered debounced events are discarded. Idempotent; also invoked on
    /// drop.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("stop watching files");
        self.inner.cancel.cancel();
        lock(&self.inner.watcher).take();
        lock(&self.inner.watched_files).clear();
        lock(&self.inner.watched_dirs).clear();
    }

    /// Number of files currently watched. Exposed for diagnostics.
    pub fn watched_file_count(&self) -> usize {
        lock(&self.inner.watched_files).len()
    }
}

impl Drop for FileObserver {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    fn assert_open(&self) -> Result<(), ObserverError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ObserverError::Closed);
        }
        Ok(())
    }
}

async fn run_loop(
    inner: &Inner,
    raw_rx: &AsyncMutex<mpsc::UnboundedReceiver<notify::Event>>,
    debouncer: &EventDebouncer,
) {
    debug!("file observation task running");
    let mut raw_rx = raw_rx.lock().await;
    loop {
        tokio::select! {
            () = inner.cancel.cancelled() => break,
            raw = raw_rx.recv() => {
                let Some(raw) = raw else { break };
                dispatch_raw(inner, &raw, debouncer);
            }
        }
    }
    debug!("file observation task stopped");
}

fn dispatch_raw(inner: &Inner, raw: &notify::Event, debouncer: &EventDebouncer) {
    // Overflow, access and other uninteresting kinds carry no actionable
    // change for a credential file.
    let kind = match raw.kind {
        notify::EventKind::Create(_) => FileChangeKind::Created,
        notify::EventKind::Modify(_) => FileChangeKind::Modified,
        notify::EventKind::Remove(_) => FileChangeKind::Deleted,
        _ => return,
    };

    // The map guard is released before delivery: a zero-window debouncer
    // delivers synchronously into consumers that may call back into watch or
    // unwatch.
    let matched: Vec<PathBuf> = {
        let files = lock(&inner.watched_files);
        raw.paths
            .iter()
            .filter(|path| files.contains_key(path.as_path()))
            .map(|path| path.to_path_buf())
            .collect()
    };

    for path in matched {
        debug!("change detected in file {}", path.display());
        debouncer.accept(FileChangeEvent::single(path, kind));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let observer = FileObserver::new(Duration::ZERO).unwrap();
        observer.start(|_| {}).unwrap();
        assert!(matches!(
            observer.start(|_| {}),
            Err(ObserverError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn closed_observer_rejects_watch_and_start() {
        let observer = FileObserver::new(Duration::ZERO).unwrap();
        observer.close();

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("watched");
        std::fs::write(&file, b"x").unwrap();

        assert!(matches!(observer.watch(&file), Err(ObserverError::Closed)));
        assert!(matches!(observer.start(|_| {}), Err(ObserverError::Closed)));
    }

    #[tokio::test]
    async fn watch_is_idempotent_per_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("watched");
        std::fs::write(&file, b"x").unwrap();

        let observer = FileObserver::new(Duration::ZERO).unwrap();
        observer.watch(&file).unwrap();
        observer.watch(&file).unwrap();
        assert_eq!(observer.watched_file_count(), 1);
    }

    #[tokio::test]
    async fn unwatch_releases_directory_with_last_file() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, b"x").unwrap();
        std::fs::write(&b, b"x").unwrap();

        let observer = FileObserver::new(Duration::ZERO).unwrap();
        observer.watch(&a).unwrap();
        observer.watch(&b).unwrap();

        observer.unwatch(&a);
        assert_eq!(observer.watched_file_count(), 1);
        observer.unwatch(&b);
        assert_eq!(observer.watched_file_count(), 0);
    }

    #[test]
    fn watch_key_joins_canonical_parent_and_name() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("missing-is-fine");
        let key = watch_key(&file).unwrap();
        assert_eq!(key.file_name().unwrap(), "missing-is-fine");
        assert!(key.parent().unwrap().is_absolute());
    }
}
