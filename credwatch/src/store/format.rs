//! Credential parser seam.
//!
//! Credential files come in many container formats (PKCS#12, JKS, PEM
//! bundles). The core only needs a way to turn bytes plus a password into a
//! [`ParsedCredentials`]; everything else about a format is an external
//! concern. Hosts register parsers for the tags their descriptors use; a PEM
//! parser ships in-crate.

use crate::error::FormatError;
use crate::store::parsed::ParsedCredentials;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use x509_parser::prelude::*;

/// Parses credential file bytes into a [`ParsedCredentials`].
///
/// `password` is the store password (from the descriptor's
/// `password.location` file, or passed at load); `key_password` is the
/// private-key password from `keypass.location`, for container formats whose
/// key entries carry their own protection. Formats that encrypt nothing
/// (like PEM) ignore both.
pub trait CredentialFormat: Send + Sync {
    /// Parses `data` using the supplied passwords.
    ///
    /// # Errors
    ///
    /// Returns a [`FormatError`] when the data is malformed, rejects a
    /// password, or contains no entries.
    fn parse(
        &self,
        data: &[u8],
        password: Option<&str>,
        key_password: Option<&str>,
    ) -> Result<ParsedCredentials, FormatError>;
}

/// Registry mapping format tags to parsers.
///
/// Tags are case-insensitive (`pem` and `PEM` name the same parser).
pub struct FormatRegistry {
    formats: RwLock<HashMap<String, Arc<dyn CredentialFormat>>>,
}

impl std::fmt::Debug for FormatRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tags: Vec<String> = self
            .formats
            .read()
            .map(|formats| formats.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("FormatRegistry").field("tags", &tags).finish()
    }
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl FormatRegistry {
    /// Creates an empty registry.
    pub fn empty() -> Self {
        Self {
            formats: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a registry with the built-in formats ([`PemFormat`] under
    /// `PEM`).
    pub fn with_defaults() -> Self {
        let registry = Self::empty();
        registry.register("PEM", Arc::new(PemFormat));
        registry
    }

    /// Registers `format` under `tag`, replacing any previous registration.
    pub fn register(&self, tag: &str, format: Arc<dyn CredentialFormat>) {
        let mut formats = match self.formats.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        formats.insert(tag.to_ascii_uppercase(), format);
    }

    /// Looks up the parser for `tag`.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::UnknownFormat`] when nothing is registered
    /// under `tag`.
    pub fn get(&self, tag: &str) -> Result<Arc<dyn CredentialFormat>, FormatError> {
        let formats = match self.formats.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        formats
            .get(&tag.to_ascii_uppercase())
            .cloned()
            .ok_or_else(|| FormatError::UnknownFormat(tag.to_owned()))
    }
}

/// Parser for concatenated PEM bundles.
///
/// All `CERTIFICATE` sections and all private-key sections (PKCS#8, PKCS#1,
/// SEC1) are read from the bundle. Every key becomes a key entry carrying the
/// full certificate list as its chain; self-issued certificates additionally
/// become certificate entries (trust anchors). When the bundle holds no keys,
/// every certificate becomes a certificate entry. Aliases derive from the
/// subject common name, falling back to positional names.
///
/// PEM bundles are not encrypted as a container, so both passwords are
/// ignored.
#[derive(Debug, Clone, Copy)]
pub struct PemFormat;

impl CredentialFormat for PemFormat {
    fn parse(
        &self,
        data: &[u8],
        _password: Option<&str>,
        _key_password: Option<&str>,
    ) -> Result<ParsedCredentials, FormatError> {
        let certs = CertificateDer::pem_slice_iter(data)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| FormatError::Malformed(format!("certificate: {err:?}")))?;
        let keys = PrivateKeyDer::pem_slice_iter(data)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| FormatError::Malformed(format!("private key: {err:?}")))?;

        if certs.is_empty() && keys.is_empty() {
            return Err(FormatError::NoEntries);
        }

        let mut parsed = ParsedCredentials::new();
        let has_keys = !keys.is_empty();

        for (index, key) in keys.into_iter().enumerate() {
            let base = certs
                .first()
                .and_then(subject_common_name)
                .unwrap_or_else(|| format!("key-{index}"));
            let alias = unique_alias(&parsed, base);
            parsed.insert_key_entry(alias, Arc::new(key), certs.clone());
        }

        for (index, certificate) in certs.iter().enumerate() {
            if has_keys && !is_self_issued(certificate) {
                continue;
            }
            let base = subject_common_name(certificate).unwrap_or_else(|| format!("cert-{index}"));
            let alias = unique_alias(&parsed, base);
            parsed.insert_certificate_entry(alias, certificate.clone());
        }

        Ok(parsed)
    }
}

fn subject_common_name(certificate: &CertificateDer<'_>) -> Option<String> {
    let (_, cert) = parse_x509_certificate(certificate.as_ref()).ok()?;
    let name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_owned);
    name
}

fn is_self_issued(certificate: &CertificateDer<'_>) -> bool {
    parse_x509_certificate(certificate.as_ref())
        .map(|(_, cert)| cert.subject() == cert.issuer())
        .unwrap_or(false)
}

fn unique_alias(parsed: &ParsedCredentials, base: String) -> String {
    if !parsed.contains_alias(&base) {
        return base;
    }
    let mut counter = 1usize;
    loop {
        let candidate = format!("{base}-{counter}");
        if !parsed.contains_alias(&candidate) {
            return candidate;
        }
        counter += 1;
    }
}
