//! Resettable TLS context: rustls configurations plus live-engine tracking,
//! reset as a unit when credentials reload.

use crate::engine::{ResettableEngine, TlsEngine};
use crate::error::{Error, Result};
use crate::material::signing_provider;
use crate::prelude::*;
use crate::selector::ReloadableKeySelector;
use crate::session::{FlushableClientSessionCache, FlushableServerSessionCache};
use crate::validator::ReloadableTrustValidator;
use credwatch::{BoxError, DynamicCredentialStore, ReloadCoordinator, ReloadListener};
use rustls::client::Resumption;
use rustls::pki_types::ServerName;
use rustls::version::{TLS12, TLS13};
use rustls::{
    ClientConfig, ClientConnection, ProtocolVersion, ServerConfig, ServerConnection,
    SupportedProtocolVersion,
};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

static TLS12_ONLY: &[&SupportedProtocolVersion] = &[&TLS12];
static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&TLS13];
static TLS_ANY: &[&SupportedProtocolVersion] = &[&TLS13, &TLS12];

/// Protocol selection for a [`ResettableTlsContext`], keyed by the
/// conventional algorithm names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsProtocol {
    /// `TLSv1` — not implemented by rustls.
    Tls10,
    /// `TLSv1.1` — not implemented by rustls.
    Tls11,
    /// `TLSv1.2` only.
    Tls12,
    /// `TLSv1.3` only.
    Tls13,
    /// `TLS` — every version the stack supports.
    Any,
    /// `Default` — the stack's default version set.
    Default,
}

impl TlsProtocol {
    /// Resolves a conventional algorithm name (`TLSv1.2`, `TLS`, ...).
    pub fn from_algorithm_name(name: &str) -> Option<Self> {
        match name {
            "TLSv1" => Some(Self::Tls10),
            "TLSv1.1" => Some(Self::Tls11),
            "TLSv1.2" => Some(Self::Tls12),
            "TLSv1.3" => Some(Self::Tls13),
            "TLS" => Some(Self::Any),
            "Default" => Some(Self::Default),
            _ => None,
        }
    }

    /// The conventional algorithm name for this selection.
    pub fn algorithm_name(&self) -> &'static str {
        match self {
            Self::Tls10 => "TLSv1",
            Self::Tls11 => "TLSv1.1",
            Self::Tls12 => "TLSv1.2",
            Self::Tls13 => "TLSv1.3",
            Self::Any => "TLS",
            Self::Default => "Default",
        }
    }

    fn versions(&self) -> Result<&'static [&'static SupportedProtocolVersion]> {
        match self {
            Self::Tls10 | Self::Tls11 => {
                Err(Error::UnsupportedProtocol(self.algorithm_name().to_owned()))
            }
            Self::Tls12 => Ok(TLS12_ONLY),
            Self::Tls13 => Ok(TLS13_ONLY),
            Self::Any | Self::Default => Ok(TLS_ANY),
        }
    }
}

struct Configs {
    client: Arc<ClientConfig>,
    server: Arc<ServerConfig>,
}

/// TLS context whose existing sessions and engines can be forced onto new
/// credentials.
///
/// Once initialized with a [`ReloadableKeySelector`] and a
/// [`ReloadableTrustValidator`], the context hands out engine-style TLS
/// connections and tracks them weakly. On credential reload it:
///
/// 1. flushes both session caches, so no future handshake resumes a session
///    established under retired credentials;
/// 2. walks the live engines, skipping those whose outbound is already
///    closed: TLS 1.3 (and later) engines get a close_notify (there is no
///    renegotiation to use), earlier engines get a fresh-handshake request
///    and the peer's policy decides between renegotiating and dropping the
///    connection. Engine errors are logged, never fatal.
///
/// Stream-socket TLS is not supported; only engine-style TLS with explicit
/// wrap/unwrap steps is.
pub struct ResettableTlsContext {
    protocol: TlsProtocol,
    client_sessions: Arc<FlushableClientSessionCache>,
    server_sessions: Arc<FlushableServerSessionCache>,
    configs: Mutex<Option<Configs>>,
    stores: Mutex<Vec<Arc<DynamicCredentialStore>>>,
    engines: Mutex<Vec<Weak<dyn ResettableEngine>>>,
}

impl std::fmt::Debug for ResettableTlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResettableTlsContext")
            .field("protocol", &self.protocol.algorithm_name())
            .field("initialized", &lock(&self.configs).is_some())
            .field("engines", &self.engine_count())
            .finish()
    }
}

/// Witness type for the unsupported stream-socket surface; cannot be
/// constructed.
#[derive(Debug)]
pub enum StreamSocketFactory {}

impl ResettableTlsContext {
    /// Creates an uninitialized context for `protocol`.
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedProtocol`] for versions rustls does not implement
    /// (`TLSv1`, `TLSv1.1`).
    pub fn new(protocol: TlsProtocol) -> Result<Arc<Self>> {
        protocol.versions()?;
        Ok(Arc::new(Self {
            protocol,
            client_sessions: Arc::new(FlushableClientSessionCache::default()),
            server_sessions: Arc::new(FlushableServerSessionCache::default()),
            configs: Mutex::new(None),
            stores: Mutex::new(Vec::new()),
            engines: Mutex::new(Vec::new()),
        }))
    }

    /// Initializes the context: builds the client and server rustls
    /// configurations over `key_selector` and `trust_validator`, records the
    /// credential stores they depend on, and — when a coordinator is given —
    /// registers for reload notifications.
    ///
    /// Registration happens after the configurations are built, so an early
    /// reload callback can never observe a half-initialized context.
    ///
    /// # Errors
    ///
    /// rustls configuration building errors.
    pub fn init(
        self: &Arc<Self>,
        key_selector: &Arc<ReloadableKeySelector>,
        trust_validator: &Arc<ReloadableTrustValidator>,
        coordinator: Option<&ReloadCoordinator>,
    ) -> Result<()> {
        let versions = self.protocol.versions()?;
        let provider = signing_provider()?;

        let mut client = ClientConfig::builder_with_provider(Arc::clone(provider))
            .with_protocol_versions(versions)?
            .dangerous()
            .with_custom_certificate_verifier(trust_validator.server_verifier())
            .with_client_cert_resolver(Arc::clone(key_selector) as _);
        client.resumption = Resumption::store(Arc::clone(&self.client_sessions) as _);

        let mut server = ServerConfig::builder_with_provider(Arc::clone(provider))
            .with_protocol_versions(versions)?
            .with_client_cert_verifier(trust_validator.client_verifier())
            .with_cert_resolver(Arc::clone(key_selector) as _);
        server.session_storage = Arc::clone(&self.server_sessions) as _;

        let mut stores = key_selector.underlying_stores();
        for store in trust_validator.underlying_stores() {
            if !stores.iter().any(|known| Arc::ptr_eq(known, &store)) {
                stores.push(store);
            }
        }

        *lock(&self.configs) = Some(Configs {
            client: Arc::new(client),
            server: Arc::new(server),
        });
        *lock(&self.stores) = stores;
        debug!("initialized {self:?}");

        if let Some(coordinator) = coordinator {
            coordinator.listen(self);
        }
        Ok(())
    }

    /// The client configuration, for hosts that drive their own connections.
    ///
    /// # Errors
    ///
    /// [`Error::NotInitialized`] before [`init`](ResettableTlsContext::init).
    pub fn client_config(&self) -> Result<Arc<ClientConfig>> {
        lock(&self.configs)
            .as_ref()
            .map(|configs| Arc::clone(&configs.client))
            .ok_or(Error::NotInitialized)
    }

    /// The server configuration, for hosts that drive their own connections.
    ///
    /// # Errors
    ///
    /// [`Error::NotInitialized`] before [`init`](ResettableTlsContext::init).
    pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
        lock(&self.configs)
            .as_ref()
            .map(|configs| Arc::clone(&configs.server))
            .ok_or(Error::NotInitialized)
    }

    /// Creates a client-side TLS engine for `server_name` and tracks it for
    /// reset.
    ///
    /// # Errors
    ///
    /// [`Error::NotInitialized`] before init, [`Error::InvalidServerName`]
    /// for names TLS cannot carry, or rustls connection-construction errors.
    pub fn create_client_engine(&self, server_name: &str) -> Result<Arc<TlsEngine>> {
        let config = self.client_config()?;
        let name = ServerName::try_from(server_name.to_owned())
            .map_err(|_| Error::InvalidServerName(server_name.to_owned()))?;
        let conn = ClientConnection::new(config, name)?;
        let engine = Arc::new(TlsEngine::from_client(conn));
        self.track(Arc::clone(&engine) as Arc<dyn ResettableEngine>);
        debug!("created client engine on {self:?}");
        Ok(engine)
    }

    /// Creates a server-side TLS engine and tracks it for reset.
    ///
    /// # Errors
    ///
    /// [`Error::NotInitialized`] before init, or rustls
    /// connection-construction errors.
    pub fn create_server_engine(&self) -> Result<Arc<TlsEngine>> {
        let config = self.server_config()?;
        let conn = ServerConnection::new(config)?;
        let engine = Arc::new(TlsEngine::from_server(conn));
        self.track(Arc::clone(&engine) as Arc<dyn ResettableEngine>);
        debug!("created server engine on {self:?}");
        Ok(engine)
    }

    /// Tracks a host-provided engine for reset alongside the context's own.
    ///
    /// The engine is held weakly; the application keeps the only strong
    /// references.
    pub fn track_engine(&self, engine: &Arc<dyn ResettableEngine>) {
        self.track(Arc::clone(engine));
    }

    /// The client-side session cache.
    pub fn client_session_cache(&self) -> &Arc<FlushableClientSessionCache> {
        &self.client_sessions
    }

    /// The server-side session cache.
    pub fn server_session_cache(&self) -> &Arc<FlushableServerSessionCache> {
        &self.server_sessions
    }

    /// Unsupported: stream-socket TLS for outbound connections.
    ///
    /// # Errors
    ///
    /// Always [`Error::StreamSocketsUnsupported`].
    pub fn stream_socket_factory(&self) -> Result<StreamSocketFactory> {
        Err(Error::StreamSocketsUnsupported)
    }

    /// Unsupported: stream-socket TLS for listening sockets.
    ///
    /// # Errors
    ///
    /// Always [`Error::StreamSocketsUnsupported`].
    pub fn server_stream_socket_factory(&self) -> Result<StreamSocketFactory> {
        Err(Error::StreamSocketsUnsupported)
    }

    /// Number of live tracked engines.
    pub fn engine_count(&self) -> usize {
        lock(&self.engines)
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    fn track(&self, engine: Arc<dyn ResettableEngine>) {
        let mut engines = lock(&self.engines);
        engines.retain(|weak| weak.strong_count() > 0);
        engines.push(Arc::downgrade(&engine));
    }

    fn reset(&self) {
        info!("resetting {self:?}: invalidating sessions");
        self.client_sessions.flush();
        self.server_sessions.flush();

        let live: Vec<Arc<dyn ResettableEngine>> = {
            let mut engines = lock(&self.engines);
            engines.retain(|weak| weak.strong_count() > 0);
            engines.iter().filter_map(Weak::upgrade).collect()
        };

        info!("resetting {self:?}: {} live engines", live.len());
        for engine in live {
            if engine.is_outbound_done() {
                continue;
            }
            engine.invalidate_session();

            let result = if is_tls13_or_later(engine.negotiated_protocol()) {
                engine.close_outbound()
            } else {
                engine.begin_handshake()
            };
            if let Err(err) = result {
                // Commonly a broken or half-closed connection; the peer's
                // recovery path takes it from here.
                warn!("could not reset engine: {err}");
            }
        }
    }
}

fn is_tls13_or_later(version: Option<ProtocolVersion>) -> bool {
    match version {
        Some(
            ProtocolVersion::SSLv2
            | ProtocolVersion::SSLv3
            | ProtocolVersion::TLSv1_0
            | ProtocolVersion::TLSv1_1
            | ProtocolVersion::TLSv1_2,
        ) => false,
        Some(_) => true,
        // No negotiated protocol yet: treat like the pre-1.3 world and let
        // the handshake request sort it out.
        None => false,
    }
}

impl ReloadListener for ResettableTlsContext {
    fn underlying_stores(&self) -> Vec<Arc<DynamicCredentialStore>> {
        lock(&self.stores).clone()
    }

    fn on_reloaded(&self) -> std::result::Result<(), BoxError> {
        self.reset();
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
