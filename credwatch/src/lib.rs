#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

//! # credwatch
//!
//! Hot reloading of TLS credentials for long-running processes whose TLS
//! stack normally loads key material once at startup.
//!
//! When an operator rewrites a credential file (or its password file) on
//! disk, this crate observes the change, coalesces the burst of filesystem
//! events it causes, re-parses the credential material, and notifies every
//! dependent consumer in registration order. It never touches sockets: it
//! publishes credentials to whatever TLS engine the host application uses
//! (see the companion `credwatch-rustls` crate for the rustls integration).
//!
//! The moving parts, leaves first:
//!
//! * [`load_password`] — password files, UTF-8, trimmed.
//! * [`CredentialFileSpec`] — descriptor of one watched credential set.
//! * [`FileObserver`] / [`EventDebouncer`] — file-level change observation
//!   with per-file event coalescing.
//! * [`DynamicCredentialStore`] — read-only credential container that
//!   re-parses itself from disk.
//! * [`ReloadCoordinator`] — routes file events to stores and fans reload
//!   callbacks out to [`ReloadListener`]s in registration order.
//!
//! ```no_run
//! use credwatch::{DynamicCredentialStore, FileObserver, FormatRegistry, ReloadCoordinator};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let observer = FileObserver::new(Duration::from_millis(1000))?;
//! let coordinator = ReloadCoordinator::start(observer)?;
//!
//! let descriptor = b"location=/etc/service/identity.pem\nkeystore.algorithm=PEM\n";
//! let store = DynamicCredentialStore::open(
//!     descriptor,
//!     None,
//!     Arc::new(FormatRegistry::with_defaults()),
//! )?;
//! coordinator.register(&store)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature flags
//!
//! * `logging` (default) — emit `log` records
//! * `tracing` — emit `tracing` events instead

mod coordinator;
mod error;
mod observability;
mod password;
mod prelude;
mod spec;
pub mod store;
pub mod watcher;

pub use coordinator::{ReloadCoordinator, ReloadListener};
pub use error::{BoxError, FormatError, ObserverError, SpecError, StoreError};
pub use password::load_password;
pub use spec::{
    CredentialFileSpec, DEFAULT_FORMAT_TAG, KEY_ALGORITHM, KEY_KEYPASS_LOCATION,
    KEY_LOCATION, KEY_PASSWORD_LOCATION,
};
pub use store::{
    CredentialEntry, CredentialFormat, DynamicCredentialStore, FormatRegistry,
    ParsedCredentials, PemFormat,
};
pub use watcher::{EventConsumer, EventDebouncer, FileChangeEvent, FileChangeKind, FileObserver};

/// Default debounce window in milliseconds for file-change events.
pub const DEFAULT_EVENT_BUFFER_WINDOW_MS: u64 = 1000;

/// Environment variable overriding the debounce window, in milliseconds.
pub const EVENT_BUFFER_WINDOW_ENV: &str = "CREDWATCH_EVENT_BUFFER_WINDOW_MS";

/// Resolves the debounce window from [`EVENT_BUFFER_WINDOW_ENV`], falling
/// back to [`DEFAULT_EVENT_BUFFER_WINDOW_MS`]. Unparseable values fall back
/// too.
pub fn event_buffer_window() -> std::time::Duration {
    let millis = std::env::var(EVENT_BUFFER_WINDOW_ENV)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_EVENT_BUFFER_WINDOW_MS);
    std::time::Duration::from_millis(millis)
}
