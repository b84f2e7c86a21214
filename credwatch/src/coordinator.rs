//! Coordination of stores, reload listeners, and file watching.
//!
//! This is the one place where files, credential stores, and their dependent
//! TLS components meet. Every topology mutation and every reload propagation
//! serializes on the same lock, so registration never races event delivery.

use crate::error::{BoxError, ObserverError, StoreError};
use crate::prelude::*;
use crate::store::DynamicCredentialStore;
use crate::watcher::{FileChangeEvent, FileObserver};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Consumer of credential reload notifications.
///
/// Implemented by key selectors, trust validators, and TLS contexts that
/// rebuild themselves when a store reloads. Callbacks run on the coordinator
/// lock and must neither block nor re-enter the coordinator.
pub trait ReloadListener: Send + Sync {
    /// The credential stores this listener depends on.
    fn underlying_stores(&self) -> Vec<Arc<DynamicCredentialStore>>;

    /// One of the underlying stores has been reloaded.
    ///
    /// # Errors
    ///
    /// A failure is logged by the coordinator and does not stop the
    /// notification of other listeners.
    fn on_reloaded(&self) -> Result<(), BoxError>;
}

struct StoreEntry {
    store: Weak<DynamicCredentialStore>,
    listeners: Vec<(u64, Weak<dyn ReloadListener>)>,
}

#[derive(Default)]
struct State {
    entries: Vec<StoreEntry>,
    next_seq: u64,
}

/// Routes file events to credential stores and fans reload notifications out
/// to their listeners in registration order.
///
/// Stores and listeners are held weakly: dropping the last strong reference
/// outside the coordinator is enough to retire them. A dead listener is never
/// invoked; a file event that finds no live store for its path releases the
/// watch on that path.
pub struct ReloadCoordinator {
    observer: FileObserver,
    state: Mutex<State>,
}

impl std::fmt::Debug for ReloadCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReloadCoordinator")
            .field("stores", &self.store_count())
            .field("listeners", &self.listener_total())
            .finish()
    }
}

impl ReloadCoordinator {
    /// Starts a coordinator on `observer`.
    ///
    /// The observer's background task is started here with this coordinator
    /// as its consumer; it must not have been started before. Must be called
    /// from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Propagates [`ObserverError`] from starting the observer.
    pub fn start(observer: FileObserver) -> Result<Arc<Self>, ObserverError> {
        let coordinator = Arc::new(Self {
            observer,
            state: Mutex::new(State::default()),
        });

        let weak = Arc::downgrade(&coordinator);
        coordinator.observer.start(move |event| {
            if let Some(coordinator) = weak.upgrade() {
                coordinator.on_file_changed(&event);
            }
        })?;

        Ok(coordinator)
    }

    /// Registers `store` and starts watching its data file.
    ///
    /// Registering the same store twice has no further effect. The store is
    /// held weakly.
    ///
    /// # Errors
    ///
    /// Propagates [`ObserverError`] from the watch registration.
    pub fn register(&self, store: &Arc<DynamicCredentialStore>) -> Result<(), ObserverError> {
        let mut state = self.lock_state();
        let already = state.entries.iter().any(|entry| {
            entry
                .store
                .upgrade()
                .is_some_and(|existing| Arc::ptr_eq(&existing, store))
        });
        if already {
            return Ok(());
        }

        self.observer.watch(store.spec().data_path())?;
        state.entries.push(StoreEntry {
            store: Arc::downgrade(store),
            listeners: Vec::new(),
        });
        debug!(
            "watching credential store {store:?}, {} stores watched",
            state.entries.len()
        );
        Ok(())
    }

    /// Attaches `listener` to every registered store it depends on.
    ///
    /// The listener is held weakly and receives a fresh sequence number per
    /// attachment; notification order follows these numbers. Re-attaching an
    /// already-attached listener refreshes its sequence number (it moves to
    /// the end of the ordering) instead of duplicating it.
    pub fn listen<L: ReloadListener + 'static>(&self, listener: &Arc<L>) {
        let targets = listener.underlying_stores();
        let listener: Arc<dyn ReloadListener> = Arc::clone(listener) as Arc<dyn ReloadListener>;
        let weak = Arc::downgrade(&listener);

        let mut state = self.lock_state();
        let State { entries, next_seq } = &mut *state;
        for target in &targets {
            for entry in entries.iter_mut() {
                let Some(store) = entry.store.upgrade() else {
                    continue;
                };
                if !Arc::ptr_eq(&store, target) {
                    continue;
                }
                entry
                    .listeners
                    .retain(|(_, existing)| !Weak::ptr_eq(existing, &weak));
                let seq = *next_seq;
                *next_seq += 1;
                entry.listeners.push((seq, Weak::clone(&weak)));
                debug!(
                    "listener #{seq} attached to {store:?}, {} listeners",
                    entry.listeners.len()
                );
            }
        }
    }

    /// Handles a (debounced) file change: reloads every live store watching
    /// the path and notifies its listeners in ascending sequence order.
    ///
    /// A store whose reload fails keeps its previous credentials and its
    /// listeners are not notified for this event. When no live store watches
    /// the path anymore, the path is unwatched.
    pub fn on_file_changed(&self, event: &FileChangeEvent) {
        debug!(
            "file {} changed: {:?}",
            event.path.display(),
            event.kinds
        );

        let mut state = self.lock_state();
        state.entries.retain(|entry| entry.store.strong_count() > 0);

        let mut matched = false;
        for entry in state.entries.iter_mut() {
            let Some(store) = entry.store.upgrade() else {
                continue;
            };
            if !store.watches_path(&event.path) {
                continue;
            }
            matched = true;

            match store.reload_from_disk() {
                Ok(()) => {
                    info!("reloaded credential store {store:?}");
                }
                Err(err) => {
                    error!("could not reload credential store {store:?}: {err}");
                    continue;
                }
            }
            notify(&mut entry.listeners);
        }

        if !matched {
            self.observer.unwatch_key(&event.path);
        }
    }

    /// Operator-initiated global reload: reloads every live store, then
    /// notifies all listeners across all stores in one global ascending
    /// sequence order.
    ///
    /// Failures are logged, collected, and returned; they never abort the
    /// sweep.
    pub fn reload_all(&self) -> Vec<(PathBuf, StoreError)> {
        info!("reloading all credential stores");
        let mut state = self.lock_state();
        state.entries.retain(|entry| entry.store.strong_count() > 0);

        let mut failures = Vec::new();
        for entry in &state.entries {
            let Some(store) = entry.store.upgrade() else {
                continue;
            };
            if let Err(err) = store.reload_from_disk() {
                error!("could not reload credential store {store:?}: {err}");
                failures.push((store.spec().data_path().to_owned(), err));
            }
        }

        let mut all: Vec<(u64, Weak<dyn ReloadListener>)> = state
            .entries
            .iter()
            .flat_map(|entry| entry.listeners.iter().cloned())
            .collect();
        all.sort_by_key(|(seq, _)| *seq);
        for (_, weak) in &all {
            call_listener(weak);
        }

        for entry in state.entries.iter_mut() {
            entry.listeners.retain(|(_, weak)| weak.strong_count() > 0);
        }

        failures
    }

    /// Number of live registered stores.
    pub fn store_count(&self) -> usize {
        self.lock_state()
            .entries
            .iter()
            .filter(|entry| entry.store.strong_count() > 0)
            .count()
    }

    /// Number of live listeners attached to `store`.
    pub fn listener_count(&self, store: &Arc<DynamicCredentialStore>) -> usize {
        self.lock_state()
            .entries
            .iter()
            .find(|entry| {
                entry
                    .store
                    .upgrade()
                    .is_some_and(|existing| Arc::ptr_eq(&existing, store))
            })
            .map(|entry| {
                entry
                    .listeners
                    .iter()
                    .filter(|(_, weak)| weak.strong_count() > 0)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Number of live listeners across all stores.
    pub fn listener_total(&self) -> usize {
        self.lock_state()
            .entries
            .iter()
            .map(|entry| {
                entry
                    .listeners
                    .iter()
                    .filter(|(_, weak)| weak.strong_count() > 0)
                    .count()
            })
            .sum()
    }

    /// The file observer this coordinator drives.
    pub fn observer(&self) -> &FileObserver {
        &self.observer
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Notifies one store's listeners in ascending sequence order, pruning dead
/// ones. Listeners are appended with increasing sequence numbers, so the
/// vector is already ordered.
fn notify(listeners: &mut Vec<(u64, Weak<dyn ReloadListener>)>) {
    listeners.retain(|(_, weak)| weak.strong_count() > 0);
    for (_, weak) in listeners.iter() {
        call_listener(weak);
    }
}

fn call_listener(weak: &Weak<dyn ReloadListener>) {
    let Some(listener) = weak.upgrade() else {
        return;
    };
    if let Err(err) = listener.on_reloaded() {
        warn!("reload listener failed: {err}");
    }
}
