//! Builders turning a store's parsed credentials into rustls material.

use crate::error::{Error, Result};
use crate::prelude::*;
use credwatch::DynamicCredentialStore;
use rustls::crypto::CryptoProvider;
use rustls::sign::CertifiedKey;
use rustls::RootCertStore;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::collections::BTreeMap;
use std::sync::Arc;
use x509_parser::prelude::*;

/// Resolves the crypto provider that signing keys, verifiers, and context
/// configurations are built with: the process default when the application
/// installed one, otherwise this crate's feature-selected provider, which
/// becomes the process default on first use so every rustls surface built
/// here agrees on one provider.
///
/// # Errors
///
/// [`Error::NoCryptoProvider`] when no provider can be resolved.
pub(crate) fn signing_provider() -> Result<&'static Arc<CryptoProvider>> {
    if let Some(provider) = CryptoProvider::get_default() {
        return Ok(provider);
    }
    // Racing installs are harmless; whichever lands first stays the default.
    let _ = feature_default_provider().install_default();
    CryptoProvider::get_default().ok_or(Error::NoCryptoProvider)
}

#[cfg(all(feature = "ring", not(feature = "aws-lc-rs")))]
fn feature_default_provider() -> CryptoProvider {
    rustls::crypto::ring::default_provider()
}

#[cfg(all(feature = "aws-lc-rs", not(feature = "ring")))]
fn feature_default_provider() -> CryptoProvider {
    rustls::crypto::aws_lc_rs::default_provider()
}

/// One selectable key entry: the certified key plus the DNS names its leaf
/// certificate answers for (precomputed so SNI matching never parses X.509
/// on the handshake path).
#[derive(Debug, Clone)]
pub(crate) struct SelectableKey {
    pub certified: Arc<CertifiedKey>,
    pub dns_names: Vec<String>,
}

/// Signing material built from one generation of a credential store: one
/// entry per key alias, plus the default alias (first in alias order).
#[derive(Debug, Clone)]
pub(crate) struct KeyMaterial {
    pub keys: BTreeMap<String, SelectableKey>,
    pub default_alias: String,
}

impl KeyMaterial {
    pub fn default_key(&self) -> Arc<CertifiedKey> {
        // The default alias always names an entry; see `build_key_material`.
        Arc::clone(&self.keys[&self.default_alias].certified)
    }

    /// The first key whose leaf certificate answers for `server_name`
    /// (lower-case). Exact matches win; single-label wildcards are honored.
    pub fn key_for_server_name(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        self.keys
            .values()
            .find(|key| {
                key.dns_names
                    .iter()
                    .any(|name| dns_name_matches(name, server_name))
            })
            .map(|key| Arc::clone(&key.certified))
    }
}

fn dns_name_matches(pattern: &str, server_name: &str) -> bool {
    if pattern == server_name {
        return true;
    }
    match pattern.strip_prefix("*.") {
        Some(suffix) => server_name
            .split_once('.')
            .is_some_and(|(_, rest)| rest == suffix),
        None => false,
    }
}

/// Builds signing material from the store's current generation.
///
/// # Errors
///
/// [`Error::NoKeyEntries`] when the store holds no key entries,
/// [`Error::NoCryptoProvider`] when no provider resolves, or
/// [`Error::CertifiedKey`] when the resolved provider rejects a key.
pub(crate) fn build_key_material(store: &DynamicCredentialStore) -> Result<KeyMaterial> {
    let credentials = store.credentials();
    let mut keys = BTreeMap::new();

    for alias in credentials.key_aliases() {
        let Some(key) = credentials.key(alias) else {
            continue;
        };
        let chain = credentials
            .certificate_chain(alias)
            .map(<[_]>::to_vec)
            .unwrap_or_default();
        let signing_key = load_signing_key(alias, &key)?;
        let certified = Arc::new(CertifiedKey::new(chain, signing_key));
        let dns_names = leaf_dns_names(&certified);
        keys.insert(
            alias.to_owned(),
            SelectableKey {
                certified,
                dns_names,
            },
        );
    }

    let default_alias = keys.keys().next().cloned().ok_or(Error::NoKeyEntries)?;
    debug!(
        "built signing material: {} key entries, default {default_alias:?}",
        keys.len()
    );

    Ok(KeyMaterial {
        keys,
        default_alias,
    })
}

fn load_signing_key(
    alias: &str,
    key: &PrivateKeyDer<'static>,
) -> Result<Arc<dyn rustls::sign::SigningKey>> {
    let provider = signing_provider()?;

    provider
        .key_provider
        .load_private_key(key.clone_key())
        .map_err(|err| Error::CertifiedKey {
            alias: alias.to_owned(),
            reason: format!("{err:?}"),
        })
}

/// Builds a root store from the store's certificate entries.
///
/// # Errors
///
/// [`Error::EmptyTrustAnchors`] when no certificate entry is accepted as a
/// trust anchor.
pub(crate) fn build_trust_anchors(store: &DynamicCredentialStore) -> Result<Arc<RootCertStore>> {
    let credentials = store.credentials();
    let mut roots = RootCertStore::empty();

    let certs = credentials
        .certificate_entries()
        .map(|(_, certificate)| certificate.clone());
    let (_added, _ignored) = roots.add_parsable_certificates(certs);

    if roots.is_empty() {
        return Err(Error::EmptyTrustAnchors);
    }
    Ok(Arc::new(roots))
}

/// DNS names (SAN `dNSName` entries plus the subject CN) of a certified
/// key's leaf certificate, lower-cased for matching against SNI.
pub(crate) fn leaf_dns_names(certified: &CertifiedKey) -> Vec<String> {
    let Some(leaf) = certified.cert.first() else {
        return Vec::new();
    };
    dns_names(leaf)
}

fn dns_names(certificate: &CertificateDer<'_>) -> Vec<String> {
    let Ok((_, cert)) = parse_x509_certificate(certificate.as_ref()) else {
        return Vec::new();
    };

    let mut names = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                names.push(dns.to_ascii_lowercase());
            }
        }
    }
    if let Some(cn) = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
    {
        let cn = cn.to_ascii_lowercase();
        if !names.contains(&cn) {
            names.push(cn);
        }
    }
    names
}
