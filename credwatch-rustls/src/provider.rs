//! Provider registration surface.
//!
//! Exposes the reloadable store, selectors, validators, and contexts under
//! stable algorithm names, so a host can resolve them the way it resolves
//! any other TLS implementation. One provider can be enabled per process,
//! either at the head of the lookup chain (intercepting the standard context
//! names) or at the tail (its components are served only when explicitly
//! requested through the provider handle or its own algorithm names).

use crate::context::{ResettableTlsContext, TlsProtocol};
use crate::error::{Error, Result};
use crate::prelude::*;
use crate::selector::{ReloadableKeySelector, SelectorStrategy};
use crate::validator::ReloadableTrustValidator;
use credwatch::{
    event_buffer_window, DynamicCredentialStore, FileObserver, FormatRegistry,
    ReloadCoordinator, StoreError,
};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

/// Algorithm name of the reloadable credential store.
pub const ALGO_KEYSTORE: &str = "DynamicKeystore";
/// Algorithm name of the simple (default-entry) key selector.
pub const ALGO_KEY_SELECTOR_X509: &str = "ReloadableX509";
/// Algorithm name of the SNI-aware key selector.
pub const ALGO_KEY_SELECTOR_PKIX: &str = "ReloadablePKIX";
/// Algorithm name of the simple trust validator.
pub const ALGO_TRUST_VALIDATOR_SIMPLE: &str = "ReloadableSimple";
/// Algorithm name of the PKIX trust validator.
pub const ALGO_TRUST_VALIDATOR_PKIX: &str = "ReloadablePKIX";

/// Where an enabled provider sits in the lookup chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallPosition {
    /// Head of the chain: the standard context names (`TLS`, `TLSv1.3`, ...)
    /// resolve to resettable contexts.
    First,
    /// Tail of the chain: components are served only when explicitly
    /// requested.
    Last,
}

fn installed_slot() -> &'static RwLock<Option<Arc<ReloadProvider>>> {
    static SLOT: OnceLock<RwLock<Option<Arc<ReloadProvider>>>> = OnceLock::new();
    SLOT.get_or_init(|| RwLock::new(None))
}

/// The hot-reload provider: owns the file observer, the coordinator, and the
/// format registry, and serves components by algorithm name.
pub struct ReloadProvider {
    position: InstallPosition,
    coordinator: Arc<ReloadCoordinator>,
    formats: Arc<FormatRegistry>,
}

impl std::fmt::Debug for ReloadProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReloadProvider")
            .field("position", &self.position)
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

/// Configuration for enabling a [`ReloadProvider`].
#[derive(Debug, Default)]
pub struct ReloadProviderBuilder {
    window: Option<Duration>,
    formats: Option<Arc<FormatRegistry>>,
}

impl ReloadProviderBuilder {
    /// Overrides the debounce window (default: the
    /// `CREDWATCH_EVENT_BUFFER_WINDOW_MS` environment variable, or 1000 ms).
    pub fn event_buffer_window(mut self, window: Duration) -> Self {
        self.window = Some(window);
        self
    }

    /// Overrides the credential format registry (default: the built-ins).
    pub fn formats(mut self, formats: Arc<FormatRegistry>) -> Self {
        self.formats = Some(formats);
        self
    }

    /// Enables the provider at the head of the lookup chain.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyEnabled`] when a provider is enabled, or observer
    /// start-up failures. Must be called from within a tokio runtime.
    pub fn enable_first(self) -> Result<Arc<ReloadProvider>> {
        self.enable(InstallPosition::First)
    }

    /// Enables the provider at the tail of the lookup chain.
    ///
    /// # Errors
    ///
    /// Same as [`ReloadProviderBuilder::enable_first`].
    pub fn enable_last(self) -> Result<Arc<ReloadProvider>> {
        self.enable(InstallPosition::Last)
    }

    fn enable(self, position: InstallPosition) -> Result<Arc<ReloadProvider>> {
        let mut slot = write_slot();
        if slot.is_some() {
            return Err(Error::AlreadyEnabled);
        }

        let window = self.window.unwrap_or_else(event_buffer_window);
        let observer = FileObserver::new(window)?;
        let coordinator = ReloadCoordinator::start(observer)?;
        let formats = self
            .formats
            .unwrap_or_else(|| Arc::new(FormatRegistry::with_defaults()));

        let provider = Arc::new(ReloadProvider {
            position,
            coordinator,
            formats,
        });
        info!("enabled hot-reload provider in {position:?} position");
        *slot = Some(Arc::clone(&provider));
        Ok(provider)
    }
}

impl ReloadProvider {
    /// Starts configuring a provider.
    pub fn builder() -> ReloadProviderBuilder {
        ReloadProviderBuilder::default()
    }

    /// Enables a default-configured provider at the head of the chain.
    ///
    /// Head position intercepts the standard context names; prefer
    /// [`ReloadProvider::enable_last`] unless interception is the point.
    ///
    /// # Errors
    ///
    /// See [`ReloadProviderBuilder::enable_first`].
    pub fn enable_first() -> Result<Arc<Self>> {
        Self::builder().enable_first()
    }

    /// Enables a default-configured provider at the tail of the chain.
    ///
    /// # Errors
    ///
    /// See [`ReloadProviderBuilder::enable_last`].
    pub fn enable_last() -> Result<Arc<Self>> {
        Self::builder().enable_last()
    }

    /// The enabled provider, if any.
    pub fn installed() -> Option<Arc<Self>> {
        read_slot().clone()
    }

    /// Whether a provider is enabled.
    pub fn is_enabled() -> bool {
        read_slot().is_some()
    }

    /// Disables the enabled provider: stops watching files and releases
    /// every OS watch handle.
    ///
    /// # Errors
    ///
    /// [`Error::NotEnabled`] when no provider is enabled.
    pub fn disable() -> Result<()> {
        let provider = write_slot().take().ok_or(Error::NotEnabled)?;
        info!("disabling hot-reload provider");
        provider.coordinator.observer().close();
        Ok(())
    }

    /// Where this provider sits in the lookup chain.
    pub fn position(&self) -> InstallPosition {
        self.position
    }

    /// The coordinator driving this provider's reloads.
    pub fn coordinator(&self) -> &Arc<ReloadCoordinator> {
        &self.coordinator
    }

    /// The credential format registry components are parsed with.
    pub fn formats(&self) -> &Arc<FormatRegistry> {
        &self.formats
    }

    /// Opens a watched credential store.
    ///
    /// The descriptor points at the credential file; the store registers
    /// with the coordinator so filesystem changes reload it.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownAlgorithm`] unless `algorithm` is
    /// [`ALGO_KEYSTORE`]; otherwise store-opening errors, unchanged.
    pub fn open_store(
        &self,
        algorithm: &str,
        descriptor: &[u8],
        password: Option<&str>,
    ) -> Result<Arc<DynamicCredentialStore>> {
        if algorithm != ALGO_KEYSTORE {
            return Err(Error::UnknownAlgorithm(algorithm.to_owned()));
        }
        let store =
            DynamicCredentialStore::open(descriptor, password, Arc::clone(&self.formats))?;
        self.coordinator.register(&store)?;
        Ok(store)
    }

    /// Builds a reloadable key selector over `store`.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownAlgorithm`] for names other than
    /// [`ALGO_KEY_SELECTOR_X509`] / [`ALGO_KEY_SELECTOR_PKIX`]; otherwise
    /// selector construction errors.
    pub fn key_selector(
        &self,
        algorithm: &str,
        store: &Arc<DynamicCredentialStore>,
    ) -> Result<Arc<ReloadableKeySelector>> {
        let strategy = match algorithm {
            ALGO_KEY_SELECTOR_X509 => SelectorStrategy::Simple,
            ALGO_KEY_SELECTOR_PKIX => SelectorStrategy::SniAware,
            _ => return Err(Error::UnknownAlgorithm(algorithm.to_owned())),
        };
        ReloadableKeySelector::with_coordinator(Arc::clone(store), strategy, &self.coordinator)
    }

    /// Builds a reloadable trust validator over `store`.
    ///
    /// Both validator names build the same webpki-backed delegates; the
    /// split exists for lookup compatibility.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownAlgorithm`] for names other than
    /// [`ALGO_TRUST_VALIDATOR_SIMPLE`] / [`ALGO_TRUST_VALIDATOR_PKIX`];
    /// otherwise validator construction errors.
    pub fn trust_validator(
        &self,
        algorithm: &str,
        store: &Arc<DynamicCredentialStore>,
    ) -> Result<Arc<ReloadableTrustValidator>> {
        match algorithm {
            ALGO_TRUST_VALIDATOR_SIMPLE | ALGO_TRUST_VALIDATOR_PKIX => {
                ReloadableTrustValidator::with_coordinator(Arc::clone(store), &self.coordinator)
            }
            _ => Err(Error::UnknownAlgorithm(algorithm.to_owned())),
        }
    }

    /// Creates an uninitialized resettable context for a protocol name
    /// (`TLSv1.2`, `TLSv1.3`, `TLS`, `Default`; `TLSv1`/`TLSv1.1` resolve
    /// but fail as unsupported by the stack).
    ///
    /// # Errors
    ///
    /// [`Error::UnknownAlgorithm`] for unknown names,
    /// [`Error::UnsupportedProtocol`] for versions rustls lacks.
    pub fn tls_context(&self, algorithm: &str) -> Result<Arc<ResettableTlsContext>> {
        let protocol = TlsProtocol::from_algorithm_name(algorithm)
            .ok_or_else(|| Error::UnknownAlgorithm(algorithm.to_owned()))?;
        ResettableTlsContext::new(protocol)
    }

    /// Reloads every registered store and notifies every listener, in one
    /// global registration order. Failures are logged and returned, never
    /// fatal.
    pub fn force_reload_all(&self) -> Vec<(PathBuf, StoreError)> {
        self.coordinator.reload_all()
    }
}

/// Chain lookup for TLS contexts by standard algorithm name.
///
/// A head-installed provider intercepts the standard names; a tail-installed
/// provider leaves them to the host's default stack and only answers its own
/// component names through the provider handle.
///
/// # Errors
///
/// [`Error::NotEnabled`] with no provider,
/// [`Error::UnknownAlgorithm`] when the name is not served from the
/// provider's position.
pub fn lookup_tls_context(algorithm: &str) -> Result<Arc<ResettableTlsContext>> {
    let provider = ReloadProvider::installed().ok_or(Error::NotEnabled)?;
    if provider.position() != InstallPosition::First {
        return Err(Error::UnknownAlgorithm(algorithm.to_owned()));
    }
    provider.tls_context(algorithm)
}

/// Convenience for operators: reload every store of the enabled provider.
///
/// # Errors
///
/// [`Error::NotEnabled`] when no provider is enabled.
pub fn force_reload_all() -> Result<Vec<(PathBuf, StoreError)>> {
    let provider = ReloadProvider::installed().ok_or(Error::NotEnabled)?;
    Ok(provider.force_reload_all())
}

fn read_slot() -> std::sync::RwLockReadGuard<'static, Option<Arc<ReloadProvider>>> {
    match installed_slot().read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_slot() -> std::sync::RwLockWriteGuard<'static, Option<Arc<ReloadProvider>>> {
    match installed_slot().write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
