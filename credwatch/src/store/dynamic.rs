//! Read-only credential store that re-parses itself from disk.

use crate::error::StoreError;
use crate::password::load_password;
use crate::prelude::*;
use crate::spec::CredentialFileSpec;
use crate::store::format::FormatRegistry;
use crate::store::parsed::ParsedCredentials;
use arc_swap::ArcSwap;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

/// Read-only credential container backed by files on disk.
///
/// `open` consumes a [`CredentialFileSpec`] descriptor — not credential bytes
/// — and parses the file the descriptor points at. [`reload_from_disk`]
/// re-reads the store password (when a password file is configured) and
/// re-parses the data file, atomically swapping in the new generation;
/// readers always observe either the old or the new parsed set, never a torn
/// state.
///
/// The store is read-only in memory: the file is the source of truth, so the
/// mutation methods all fail with [`StoreError::ReadOnly`]. Allowing
/// in-memory edits alongside reload would give ambiguous semantics (an added
/// entry would vanish on the next reload, a deleted one would reappear).
///
/// [`reload_from_disk`]: DynamicCredentialStore::reload_from_disk
pub struct DynamicCredentialStore {
    spec: CredentialFileSpec,
    formats: Arc<FormatRegistry>,
    password: Mutex<Option<String>>,
    current: ArcSwap<ParsedCredentials>,
}

impl std::fmt::Debug for DynamicCredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicCredentialStore")
            .field("spec", &self.spec)
            .field("entries", &self.current.load().len())
            .finish()
    }
}

impl DynamicCredentialStore {
    /// Opens a store from descriptor text (ISO-8859-1 bytes) and an optional
    /// store password.
    ///
    /// The first load happens here; its errors propagate unchanged and no
    /// store is created. When a `password.location` is configured it takes
    /// precedence over `password` from the very first load.
    ///
    /// # Errors
    ///
    /// Any [`StoreError`] from descriptor parsing, file reading, or
    /// credential parsing.
    pub fn open(
        descriptor: &[u8],
        password: Option<&str>,
        formats: Arc<FormatRegistry>,
    ) -> Result<Arc<Self>, StoreError> {
        let spec = CredentialFileSpec::from_bytes(descriptor)?;
        Self::from_spec(spec, password, formats)
    }

    /// Opens a store from an already-parsed descriptor.
    ///
    /// # Errors
    ///
    /// Same as [`DynamicCredentialStore::open`].
    pub fn from_spec(
        spec: CredentialFileSpec,
        password: Option<&str>,
        formats: Arc<FormatRegistry>,
    ) -> Result<Arc<Self>, StoreError> {
        let store = Self {
            spec,
            formats,
            password: Mutex::new(password.map(str::to_owned)),
            current: ArcSwap::from_pointee(ParsedCredentials::new()),
        };
        store.reload_from_disk()?;
        debug!("loaded credential store {store:?}");
        Ok(Arc::new(store))
    }

    /// Re-reads passwords and credential data from disk and swaps the parsed
    /// set in atomically.
    ///
    /// # Errors
    ///
    /// On failure the previous generation (and password) stays in effect and
    /// the error is returned.
    pub fn reload_from_disk(&self) -> Result<(), StoreError> {
        let password = match self.spec.password_path() {
            Some(path) => {
                debug!("(re)loading store password from {}", path.display());
                Some(load_password(path)?)
            }
            None => lock(&self.password).clone(),
        };
        let key_password = match self.spec.keypass_path() {
            Some(path) => {
                debug!("(re)loading key password from {}", path.display());
                Some(load_password(path)?)
            }
            None => None,
        };

        let data = fs::read(self.spec.data_path())?;
        let format = self.formats.get(self.spec.format_tag())?;
        let parsed = format.parse(&data, password.as_deref(), key_password.as_deref())?;

        *lock(&self.password) = password;
        self.current.store(Arc::new(parsed));
        Ok(())
    }

    /// The descriptor this store was opened from.
    pub fn spec(&self) -> &CredentialFileSpec {
        &self.spec
    }

    /// Serializes this store's descriptor (never the parsed credentials),
    /// marker comment included.
    pub fn spec_text(&self) -> String {
        self.spec.to_text()
    }

    /// Writes the descriptor in its ISO-8859-1 text form.
    ///
    /// This is the store's serialization: it always produces the same
    /// descriptor the store was opened from, identity marker included.
    ///
    /// # Errors
    ///
    /// I/O or encoding failures.
    pub fn write_spec_to<W: Write>(&self, writer: &mut W) -> Result<(), StoreError> {
        let bytes = self.spec.to_bytes()?;
        writer.write_all(&bytes).map_err(StoreError::Io)
    }

    /// Snapshot of the current parsed credential set.
    pub fn credentials(&self) -> Arc<ParsedCredentials> {
        self.current.load_full()
    }

    /// The private key under `alias`, if it is a key entry.
    pub fn key(&self, alias: &str) -> Option<Arc<PrivateKeyDer<'static>>> {
        self.current.load().key(alias)
    }

    /// The certificate chain under `alias`, if it is a key entry.
    pub fn certificate_chain(&self, alias: &str) -> Option<Vec<CertificateDer<'static>>> {
        self.current.load().certificate_chain(alias).map(<[_]>::to_vec)
    }

    /// The certificate for `alias` (entry certificate or chain leaf).
    pub fn certificate(&self, alias: &str) -> Option<CertificateDer<'static>> {
        self.current.load().certificate(alias).cloned()
    }

    /// When the entry under `alias` was parsed.
    pub fn creation_date(&self, alias: &str) -> Option<SystemTime> {
        self.current.load().creation_date(alias)
    }

    /// All aliases in the current generation.
    pub fn aliases(&self) -> Vec<String> {
        self.current.load().aliases().map(str::to_owned).collect()
    }

    /// Whether `alias` exists in the current generation.
    pub fn contains_alias(&self, alias: &str) -> bool {
        self.current.load().contains_alias(alias)
    }

    /// Number of entries in the current generation.
    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    /// Whether the current generation is empty.
    pub fn is_empty(&self) -> bool {
        self.current.load().is_empty()
    }

    /// Whether `alias` names a key entry.
    pub fn is_key_entry(&self, alias: &str) -> bool {
        self.current.load().is_key_entry(alias)
    }

    /// Whether `alias` names a certificate entry.
    pub fn is_certificate_entry(&self, alias: &str) -> bool {
        self.current.load().is_certificate_entry(alias)
    }

    /// The first alias whose certificate equals `certificate`.
    pub fn certificate_alias(&self, certificate: &CertificateDer<'_>) -> Option<String> {
        self.current
            .load()
            .certificate_alias(certificate)
            .map(str::to_owned)
    }

    /// Rejected: the store is read-only.
    ///
    /// # Errors
    ///
    /// Always [`StoreError::ReadOnly`].
    pub fn set_key_entry(
        &self,
        _alias: &str,
        _key: PrivateKeyDer<'static>,
        _chain: Vec<CertificateDer<'static>>,
    ) -> Result<(), StoreError> {
        Err(StoreError::ReadOnly)
    }

    /// Rejected: the store is read-only.
    ///
    /// # Errors
    ///
    /// Always [`StoreError::ReadOnly`].
    pub fn set_certificate_entry(
        &self,
        _alias: &str,
        _certificate: CertificateDer<'static>,
    ) -> Result<(), StoreError> {
        Err(StoreError::ReadOnly)
    }

    /// Rejected: the store is read-only.
    ///
    /// # Errors
    ///
    /// Always [`StoreError::ReadOnly`].
    pub fn delete_entry(&self, _alias: &str) -> Result<(), StoreError> {
        Err(StoreError::ReadOnly)
    }

    /// Whether this store's data file resolves to the same watched identity
    /// as `watch_path`.
    pub(crate) fn watches_path(&self, watch_path: &Path) -> bool {
        crate::watcher::watch_key(self.spec.data_path())
            .map(|key| key == watch_path)
            .unwrap_or(false)
    }
}

fn lock(mutex: &Mutex<Option<String>>) -> std::sync::MutexGuard<'_, Option<String>> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
