//! Error types for the rustls integration.

use thiserror::Error;

/// Result type used by this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by `credwatch-rustls`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An error from the underlying credential store.
    #[error(transparent)]
    Store(#[from] credwatch::StoreError),

    /// An error from the file observer.
    #[error(transparent)]
    Observer(#[from] credwatch::ObserverError),

    /// The store holds no key entries to select from.
    #[error("credential store holds no key entries")]
    NoKeyEntries,

    /// No rustls crypto provider is installed and none could be selected
    /// from this crate's features.
    #[error("no rustls crypto provider is available")]
    NoCryptoProvider,

    /// Failed to build a `rustls::sign::CertifiedKey` from a key entry.
    #[error("failed building rustls certified key for alias {alias:?}: {reason}")]
    CertifiedKey {
        /// Alias of the offending key entry.
        alias: String,
        /// Provider-reported reason.
        reason: String,
    },

    /// The store's certificate entries yielded no usable trust anchors.
    #[error("no usable trust anchors in credential store")]
    EmptyTrustAnchors,

    /// Failed to build a rustls webpki verifier.
    #[error("rustls verifier builder error: {0}")]
    VerifierBuilder(String),

    /// The requested protocol is not implemented by this TLS stack.
    #[error("protocol {0:?} is not supported by rustls")]
    UnsupportedProtocol(String),

    /// The engine's TLS stack has no renegotiation; new key material needs a
    /// fresh connection.
    #[error("renegotiation is not supported on this connection")]
    RenegotiationUnsupported,

    /// Stream-socket TLS is not supported; only engine-style TLS with
    /// explicit wrap/unwrap steps is.
    #[error("stream-socket TLS is not supported")]
    StreamSocketsUnsupported,

    /// The context has not been initialized with a key selector and trust
    /// validator yet.
    #[error("TLS context is not initialized")]
    NotInitialized,

    /// The server name is not valid for TLS.
    #[error("invalid server name {0:?}")]
    InvalidServerName(String),

    /// No provider serves the requested algorithm name.
    #[error("unknown algorithm {0:?}")]
    UnknownAlgorithm(String),

    /// The provider is already enabled.
    #[error("provider is already enabled")]
    AlreadyEnabled,

    /// The provider is not enabled.
    #[error("provider is not enabled")]
    NotEnabled,

    /// A rustls error occurred.
    #[error("rustls error: {0}")]
    Rustls(#[from] rustls::Error),

    /// I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
