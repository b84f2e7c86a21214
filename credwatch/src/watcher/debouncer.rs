//! Per-file time-window buffering of file-change events.
//!
//! Non-atomic file replacement (write to temp, rename) and slow writers
//! produce bursts of filesystem events; acting on the first one would reload
//! a half-written file. The debouncer opens a window on the first event for a
//! file and delivers one merged event when the window elapses.

use crate::prelude::*;
use crate::watcher::events::FileChangeEvent;
use crate::watcher::events::FileChangeKind;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Downstream consumer of merged events.
pub type EventConsumer = Arc<dyn Fn(FileChangeEvent) + Send + Sync>;

/// Buffers events per file for a fixed window, merging the kinds seen.
///
/// A zero window disables buffering: events flow straight through on the
/// calling task. Otherwise the first event for a file starts a one-shot
/// timer; further events for that file within the window append their kinds.
/// At most one window is open per file at any moment.
///
/// A consumer that panics is isolated: the panic is caught and logged, and
/// the debouncer keeps working.
pub struct EventDebouncer {
    window: Duration,
    pending: Arc<Mutex<HashMap<PathBuf, Vec<FileChangeKind>>>>,
    consumer: EventConsumer,
    cancel: CancellationToken,
}

impl std::fmt::Debug for EventDebouncer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDebouncer")
            .field("window", &self.window)
            .field("consumer", &"<consumer>")
            .finish()
    }
}

impl EventDebouncer {
    /// Creates a debouncer delivering to `consumer` after `window`.
    ///
    /// Timer tasks are spawned on the current tokio runtime and are tied to
    /// `cancel`: once cancelled, buffered events are discarded.
    pub fn new(window: Duration, consumer: EventConsumer, cancel: CancellationToken) -> Self {
        Self {
            window,
            pending: Arc::new(Mutex::new(HashMap::new())),
            consumer,
            cancel,
        }
    }

    /// Accepts a raw event, buffering or passing it straight through.
    ///
    /// Must be called from within a tokio runtime when the window is
    /// non-zero.
    pub fn accept(&self, event: FileChangeEvent) {
        if self.window.is_zero() {
            deliver(&self.consumer, event);
            return;
        }

        let mut pending = match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        match pending.get_mut(&event.path) {
            Some(kinds) => kinds.extend(event.kinds),
            None => {
                pending.insert(event.path.clone(), event.kinds);
                self.schedule(event.path);
            }
        }
    }

    fn schedule(&self, path: PathBuf) {
        let window = self.window;
        let pending = Arc::clone(&self.pending);
        let consumer = Arc::clone(&self.consumer);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("debounce window for {} cancelled, discarding buffered events", path.display());
                }
                () = tokio::time::sleep(window) => {
                    let kinds = {
                        let mut pending = match pending.lock() {
                            Ok(guard) => guard,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                        pending.remove(&path)
                    };
                    if let Some(kinds) = kinds {
                        info!("notifying changes in file {}", path.display());
                        deliver(&consumer, FileChangeEvent { path, kinds });
                    }
                }
            }
        });
    }
}

fn deliver(consumer: &EventConsumer, event: FileChangeEvent) {
    let path = event.path.clone();
    if catch_unwind(AssertUnwindSafe(|| consumer(event))).is_err() {
        warn!(
            "file-change consumer panicked handling {}; continuing",
            path.display()
        );
    }
}
