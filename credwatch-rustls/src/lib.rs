#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

//! # credwatch-rustls
//!
//! [`rustls`] integration for [`credwatch`]: when an operator rewrites a
//! credential file on disk, running TLS endpoints pick the new material up
//! without a restart.
//!
//! * [`ReloadableKeySelector`] answers rustls certificate resolution (server
//!   and client side) from the current generation of a credential store.
//! * [`ReloadableTrustValidator`] verifies peers against the store's current
//!   trust anchors.
//! * [`ResettableTlsContext`] tracks the TLS engines it creates and, on
//!   reload, flushes its session caches and forces each live engine onto the
//!   new credentials — close_notify on TLS 1.3 (no renegotiation exists),
//!   a fresh-handshake request below that.
//! * [`ReloadProvider`] exposes all of the above under stable algorithm
//!   names, installable at the head or tail of the lookup chain.
//!
//! ```no_run
//! use credwatch_rustls::{ReloadProvider, ALGO_KEYSTORE, ALGO_KEY_SELECTOR_X509,
//!     ALGO_TRUST_VALIDATOR_PKIX};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = ReloadProvider::enable_last()?;
//!
//! let descriptor = b"location=/etc/service/identity.pem\nkeystore.algorithm=PEM\n";
//! let store = provider.open_store(ALGO_KEYSTORE, descriptor, None)?;
//!
//! let selector = provider.key_selector(ALGO_KEY_SELECTOR_X509, &store)?;
//! let validator = provider.trust_validator(ALGO_TRUST_VALIDATOR_PKIX, &store)?;
//!
//! let context = provider.tls_context("TLSv1.3")?;
//! context.init(&selector, &validator, Some(provider.coordinator().as_ref()))?;
//!
//! let engine = context.create_client_engine("peer.example")?;
//! // drive engine.write_tls / engine.read_tls against the wire...
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature flags
//!
//! Exactly **one** rustls crypto provider must be enabled:
//!
//! * `ring` (default)
//! * `aws-lc-rs`
//!
//! Logging backends: `logging` (default, `log`) or `tracing`.

#[cfg(all(feature = "ring", feature = "aws-lc-rs"))]
compile_error!("Enable only one crypto provider feature: `ring` or `aws-lc-rs`.");

#[cfg(not(any(feature = "ring", feature = "aws-lc-rs")))]
compile_error!("Enable one crypto provider feature: `ring` (default) or `aws-lc-rs`.");

mod context;
mod engine;
mod error;
mod material;
mod observability;
mod prelude;
mod provider;
mod selector;
mod session;
mod validator;

pub use context::{ResettableTlsContext, StreamSocketFactory, TlsProtocol};
pub use engine::{ResettableEngine, TlsEngine};
pub use error::{Error, Result};
pub use provider::{
    force_reload_all, lookup_tls_context, InstallPosition, ReloadProvider,
    ReloadProviderBuilder, ALGO_KEYSTORE, ALGO_KEY_SELECTOR_PKIX, ALGO_KEY_SELECTOR_X509,
    ALGO_TRUST_VALIDATOR_PKIX, ALGO_TRUST_VALIDATOR_SIMPLE,
};
pub use selector::{ReloadableKeySelector, SelectorStrategy};
pub use session::{FlushableClientSessionCache, FlushableServerSessionCache};
pub use validator::ReloadableTrustValidator;
