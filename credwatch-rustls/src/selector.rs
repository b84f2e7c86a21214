//! Reloadable key selector: a delegating bridge between rustls certificate
//! resolution and a dynamic credential store.

use crate::error::Result;
use crate::material::{build_key_material, KeyMaterial};
use crate::prelude::*;
use arc_swap::ArcSwap;
use credwatch::{BoxError, DynamicCredentialStore, ReloadCoordinator, ReloadListener};
use rustls::client::ResolvesClientCert;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::SignatureScheme;
use std::sync::Arc;

/// How a key entry is chosen for a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorStrategy {
    /// Always present the default key entry (first in alias order).
    Simple,
    /// Match the ClientHello server name against each entry's leaf
    /// certificate names, falling back to the default entry.
    SniAware,
}

/// Key selector that answers rustls certificate resolution from the current
/// generation of a [`DynamicCredentialStore`].
///
/// Holds a single built delegate (the certified-key set); a reload rebuilds it from
/// the same store and swaps it atomically, so handshakes always observe
/// either the old or the new material, never a torn state. A rebuild failure
/// preserves the previous material and surfaces the error to the
/// coordinator.
///
/// Implements both [`ResolvesServerCert`] and [`ResolvesClientCert`], so one
/// selector can serve server-side and client-side configurations.
pub struct ReloadableKeySelector {
    store: Arc<DynamicCredentialStore>,
    strategy: SelectorStrategy,
    material: ArcSwap<KeyMaterial>,
}

impl std::fmt::Debug for ReloadableKeySelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let material = self.material.load();
        f.debug_struct("ReloadableKeySelector")
            .field("strategy", &self.strategy)
            .field("aliases", &material.keys.len())
            .field("default_alias", &material.default_alias)
            .finish()
    }
}

impl ReloadableKeySelector {
    /// Builds a selector over `store` without attaching it to a coordinator.
    ///
    /// # Errors
    ///
    /// Fails when the store holds no key entries or a key is rejected by the
    /// crypto provider; the error propagates unchanged, as on any first load.
    pub fn new(
        store: Arc<DynamicCredentialStore>,
        strategy: SelectorStrategy,
    ) -> Result<Arc<Self>> {
        let material = build_key_material(&store)?;
        let selector = Arc::new(Self {
            store,
            strategy,
            material: ArcSwap::from_pointee(material),
        });
        debug!("loaded key selector {selector:?}");
        Ok(selector)
    }

    /// Builds a selector and registers it for reload notifications.
    ///
    /// # Errors
    ///
    /// Same as [`ReloadableKeySelector::new`].
    pub fn with_coordinator(
        store: Arc<DynamicCredentialStore>,
        strategy: SelectorStrategy,
        coordinator: &ReloadCoordinator,
    ) -> Result<Arc<Self>> {
        let selector = Self::new(store, strategy)?;
        coordinator.listen(&selector);
        Ok(selector)
    }

    /// The store this selector reads from.
    pub fn store(&self) -> &Arc<DynamicCredentialStore> {
        &self.store
    }

    /// Aliases currently selectable, in order.
    pub fn aliases(&self) -> Vec<String> {
        self.material.load().keys.keys().cloned().collect()
    }

    fn rebuild(&self) -> Result<()> {
        let material = build_key_material(&self.store)?;
        self.material.store(Arc::new(material));
        Ok(())
    }
}

impl ReloadListener for ReloadableKeySelector {
    fn underlying_stores(&self) -> Vec<Arc<DynamicCredentialStore>> {
        vec![Arc::clone(&self.store)]
    }

    fn on_reloaded(&self) -> std::result::Result<(), BoxError> {
        match self.rebuild() {
            Ok(()) => {
                info!("reloaded key selector {self:?}");
                Ok(())
            }
            Err(err) => {
                error!("could not reload key selector {self:?}: {err}");
                Err(err.into())
            }
        }
    }
}

impl ResolvesServerCert for ReloadableKeySelector {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let material = self.material.load();
        match self.strategy {
            SelectorStrategy::Simple => Some(material.default_key()),
            SelectorStrategy::SniAware => client_hello
                .server_name()
                .map(|name| name.to_ascii_lowercase())
                .and_then(|name| material.key_for_server_name(&name))
                .or_else(|| Some(material.default_key())),
        }
    }
}

impl ResolvesClientCert for ReloadableKeySelector {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        Some(self.material.load().default_key())
    }

    fn has_certs(&self) -> bool {
        !self.material.load().keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use credwatch::FormatRegistry;
    use rcgen::{CertificateParams, DnType, KeyPair};
    use std::fs;
    use std::path::Path;

    fn identity_pem(common_name: &str) -> String {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);
        let cert = params.self_signed(&key).unwrap();
        format!("{}{}", key.serialize_pem(), cert.pem())
    }

    fn open_store(data: &Path) -> Arc<DynamicCredentialStore> {
        let text = format!("location={}\nkeystore.algorithm=PEM\n", data.display());
        DynamicCredentialStore::open(
            text.as_bytes(),
            None,
            Arc::new(FormatRegistry::with_defaults()),
        )
        .unwrap()
    }

    #[test]
    fn client_resolution_presents_the_default_key() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("id.pem");
        fs::write(&data, identity_pem("client-id")).unwrap();

        let selector =
            ReloadableKeySelector::new(open_store(&data), SelectorStrategy::Simple).unwrap();

        assert!(selector.has_certs());
        let resolved = ResolvesClientCert::resolve(selector.as_ref(), &[], &[]);
        assert!(resolved.is_some());
        assert_eq!(selector.aliases(), vec!["client-id".to_owned()]);
    }

    #[test]
    fn reload_swaps_in_material_from_the_new_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("id.pem");
        fs::write(&data, identity_pem("gen-1")).unwrap();

        let store = open_store(&data);
        let selector =
            ReloadableKeySelector::new(Arc::clone(&store), SelectorStrategy::Simple).unwrap();
        let before = selector.material.load().default_key();

        fs::write(&data, identity_pem("gen-2")).unwrap();
        store.reload_from_disk().unwrap();
        selector.on_reloaded().unwrap();

        let after = selector.material.load().default_key();
        assert_eq!(selector.aliases(), vec!["gen-2".to_owned()]);
        assert_ne!(before.cert, after.cert);
    }

    #[test]
    fn failed_rebuild_preserves_previous_material() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("id.pem");
        fs::write(&data, identity_pem("stable")).unwrap();

        let store = open_store(&data);
        let selector =
            ReloadableKeySelector::new(Arc::clone(&store), SelectorStrategy::Simple).unwrap();

        // Replace the store content with certificate-only material: the
        // store reload succeeds but the selector rebuild cannot find a key.
        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["ca.example".to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, "ca");
        let ca = params.self_signed(&ca_key).unwrap();
        fs::write(&data, ca.pem()).unwrap();
        store.reload_from_disk().unwrap();

        assert!(selector.on_reloaded().is_err());
        assert_eq!(selector.aliases(), vec!["stable".to_owned()]);
    }

    #[test]
    fn selector_with_no_keys_fails_construction() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("ca.pem");
        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["ca.example".to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, "ca");
        fs::write(&data, params.self_signed(&ca_key).unwrap().pem()).unwrap();

        let result = ReloadableKeySelector::new(open_store(&data), SelectorStrategy::Simple);
        assert!(result.is_err());
    }
}
