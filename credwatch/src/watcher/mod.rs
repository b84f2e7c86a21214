//! File observation and event debouncing.

mod debouncer;
mod events;
mod observer;

pub use debouncer::{EventConsumer, EventDebouncer};
pub use events::{FileChangeEvent, FileChangeKind};
pub use observer::FileObserver;

pub(crate) use observer::watch_key;
