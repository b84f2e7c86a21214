//! Immutable parsed view of a credential file.

use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

/// One entry of a parsed credential set.
#[derive(Debug, Clone)]
pub enum CredentialEntry {
    /// A private key with its certificate chain.
    Key {
        /// The private key. `Arc`-wrapped because secret keys are
        /// deliberately not `Clone` in `rustls-pki-types`.
        key: Arc<PrivateKeyDer<'static>>,
        /// Certificate chain, leaf first.
        chain: Vec<CertificateDer<'static>>,
    },
    /// A trusted certificate on its own (a trust anchor).
    Certificate(CertificateDer<'static>),
}

#[derive(Debug, Clone)]
struct StoredEntry {
    entry: CredentialEntry,
    created_at: SystemTime,
}

/// Parsed credential set: alias to entry, plus load timestamps.
///
/// Instances are built by a [`CredentialFormat`] parser and replaced
/// wholesale on reload; nothing mutates an instance after parsing.
///
/// [`CredentialFormat`]: crate::store::CredentialFormat
#[derive(Debug, Clone, Default)]
pub struct ParsedCredentials {
    entries: BTreeMap<String, StoredEntry>,
}

impl ParsedCredentials {
    /// Creates an empty credential set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a key entry under `alias`. Replaces any previous entry.
    pub fn insert_key_entry(
        &mut self,
        alias: impl Into<String>,
        key: Arc<PrivateKeyDer<'static>>,
        chain: Vec<CertificateDer<'static>>,
    ) {
        self.entries.insert(
            alias.into(),
            StoredEntry {
                entry: CredentialEntry::Key { key, chain },
                created_at: SystemTime::now(),
            },
        );
    }

    /// Adds a certificate entry under `alias`. Replaces any previous entry.
    pub fn insert_certificate_entry(
        &mut self,
        alias: impl Into<String>,
        certificate: CertificateDer<'static>,
    ) {
        self.entries.insert(
            alias.into(),
            StoredEntry {
                entry: CredentialEntry::Certificate(certificate),
                created_at: SystemTime::now(),
            },
        );
    }

    /// The private key stored under `alias`, if it is a key entry.
    pub fn key(&self, alias: &str) -> Option<Arc<PrivateKeyDer<'static>>> {
        match &self.entries.get(alias)?.entry {
            CredentialEntry::Key { key, .. } => Some(Arc::clone(key)),
            CredentialEntry::Certificate(_) => None,
        }
    }

    /// The certificate chain stored under `alias`, if it is a key entry.
    pub fn certificate_chain(&self, alias: &str) -> Option<&[CertificateDer<'static>]> {
        match &self.entries.get(alias)?.entry {
            CredentialEntry::Key { chain, .. } => Some(chain),
            CredentialEntry::Certificate(_) => None,
        }
    }

    /// The certificate for `alias`: the entry's certificate, or the leaf of a
    /// key entry's chain.
    pub fn certificate(&self, alias: &str) -> Option<&CertificateDer<'static>> {
        match &self.entries.get(alias)?.entry {
            CredentialEntry::Key { chain, .. } => chain.first(),
            CredentialEntry::Certificate(certificate) => Some(certificate),
        }
    }

    /// When the entry under `alias` was parsed.
    pub fn creation_date(&self, alias: &str) -> Option<SystemTime> {
        self.entries.get(alias).map(|entry| entry.created_at)
    }

    /// All aliases, in sorted order.
    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Whether `alias` exists.
    pub fn contains_alias(&self, alias: &str) -> bool {
        self.entries.contains_key(alias)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `alias` names a key entry.
    pub fn is_key_entry(&self, alias: &str) -> bool {
        matches!(
            self.entries.get(alias).map(|e| &e.entry),
            Some(CredentialEntry::Key { .. })
        )
    }

    /// Whether `alias` names a certificate entry.
    pub fn is_certificate_entry(&self, alias: &str) -> bool {
        matches!(
            self.entries.get(alias).map(|e| &e.entry),
            Some(CredentialEntry::Certificate(_))
        )
    }

    /// The first alias whose certificate equals `certificate`.
    pub fn certificate_alias(&self, certificate: &CertificateDer<'_>) -> Option<&str> {
        self.entries
            .keys()
            .find(|alias| {
                self.certificate(alias)
                    .is_some_and(|c| c.as_ref() == certificate.as_ref())
            })
            .map(String::as_str)
    }

    /// All key-entry aliases, in sorted order.
    pub fn key_aliases(&self) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(|(_, e)| matches!(e.entry, CredentialEntry::Key { .. }))
            .map(|(alias, _)| alias.as_str())
    }

    /// All certificate entries, in alias order.
    pub fn certificate_entries(&self) -> impl Iterator<Item = (&str, &CertificateDer<'static>)> {
        self.entries.iter().filter_map(|(alias, e)| match &e.entry {
            CredentialEntry::Certificate(certificate) => Some((alias.as_str(), certificate)),
            CredentialEntry::Key { .. } => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cert(bytes: &[u8]) -> CertificateDer<'static> {
        CertificateDer::from(bytes.to_vec())
    }

    fn key() -> Arc<PrivateKeyDer<'static>> {
        Arc::new(PrivateKeyDer::Pkcs8(vec![1u8, 2, 3].into()))
    }

    #[test]
    fn key_entry_accessors() {
        let mut parsed = ParsedCredentials::new();
        parsed.insert_key_entry("server", key(), vec![cert(b"leaf"), cert(b"ca")]);

        assert!(parsed.contains_alias("server"));
        assert!(parsed.is_key_entry("server"));
        assert!(!parsed.is_certificate_entry("server"));
        assert!(parsed.key("server").is_some());
        assert_eq!(parsed.certificate_chain("server").unwrap().len(), 2);
        assert_eq!(parsed.certificate("server").unwrap().as_ref(), b"leaf");
        assert!(parsed.creation_date("server").is_some());
    }

    #[test]
    fn certificate_entry_accessors() {
        let mut parsed = ParsedCredentials::new();
        parsed.insert_certificate_entry("ca", cert(b"anchor"));

        assert!(parsed.is_certificate_entry("ca"));
        assert!(parsed.key("ca").is_none());
        assert!(parsed.certificate_chain("ca").is_none());
        assert_eq!(parsed.certificate("ca").unwrap().as_ref(), b"anchor");
    }

    #[test]
    fn certificate_alias_finds_the_owner() {
        let mut parsed = ParsedCredentials::new();
        parsed.insert_certificate_entry("ca", cert(b"anchor"));
        parsed.insert_key_entry("server", key(), vec![cert(b"leaf")]);

        assert_eq!(parsed.certificate_alias(&cert(b"anchor")), Some("ca"));
        assert_eq!(parsed.certificate_alias(&cert(b"leaf")), Some("server"));
        assert_eq!(parsed.certificate_alias(&cert(b"unknown")), None);
    }

    #[test]
    fn aliases_are_sorted() {
        let mut parsed = ParsedCredentials::new();
        parsed.insert_certificate_entry("zeta", cert(b"z"));
        parsed.insert_certificate_entry("alpha", cert(b"a"));

        let aliases: Vec<_> = parsed.aliases().collect();
        assert_eq!(aliases, vec!["alpha", "zeta"]);
    }
}
