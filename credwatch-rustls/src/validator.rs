//! Reloadable trust validator: webpki-backed peer verification over the
//! certificate entries of a dynamic credential store.

use crate::error::{Error, Result};
use crate::material::{build_trust_anchors, signing_provider};
use crate::prelude::*;
use arc_swap::ArcSwap;
use credwatch::{BoxError, DynamicCredentialStore, ReloadCoordinator, ReloadListener};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{DigitallySignedStruct, DistinguishedName, RootCertStore, SignatureScheme};
use std::sync::Arc;

struct TrustDelegates {
    roots: Arc<RootCertStore>,
    server: Arc<dyn ServerCertVerifier>,
    client: Arc<dyn ClientCertVerifier>,
}

/// Trust validator that rebuilds webpki verifier delegates from the current
/// generation of a [`DynamicCredentialStore`].
///
/// Holds one pair of built delegates (peer-is-server and peer-is-client); a
/// reload rebuilds both from the store's certificate entries and swaps them
/// atomically. A rebuild failure preserves the previous pair and surfaces the
/// error to the coordinator.
///
/// Hand [`server_verifier`](ReloadableTrustValidator::server_verifier) to a
/// client configuration and
/// [`client_verifier`](ReloadableTrustValidator::client_verifier) to a server
/// configuration; both forward every verification call to the current
/// delegate.
pub struct ReloadableTrustValidator {
    store: Arc<DynamicCredentialStore>,
    delegates: ArcSwap<TrustDelegates>,
}

impl std::fmt::Debug for ReloadableTrustValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReloadableTrustValidator")
            .field("roots", &self.delegates.load().roots.len())
            .finish()
    }
}

impl ReloadableTrustValidator {
    /// Builds a validator over `store` without attaching it to a coordinator.
    ///
    /// # Errors
    ///
    /// Fails when the store yields no usable trust anchors or the verifier
    /// builders reject them; the error propagates unchanged, as on any first
    /// load.
    pub fn new(store: Arc<DynamicCredentialStore>) -> Result<Arc<Self>> {
        let delegates = build_delegates(&store)?;
        let validator = Arc::new(Self {
            store,
            delegates: ArcSwap::from_pointee(delegates),
        });
        debug!("loaded trust validator {validator:?}");
        Ok(validator)
    }

    /// Builds a validator and registers it for reload notifications.
    ///
    /// # Errors
    ///
    /// Same as [`ReloadableTrustValidator::new`].
    pub fn with_coordinator(
        store: Arc<DynamicCredentialStore>,
        coordinator: &ReloadCoordinator,
    ) -> Result<Arc<Self>> {
        let validator = Self::new(store)?;
        coordinator.listen(&validator);
        Ok(validator)
    }

    /// The store this validator reads from.
    pub fn store(&self) -> &Arc<DynamicCredentialStore> {
        &self.store
    }

    /// Verifier for peer-is-server handshakes (install in a client config).
    pub fn server_verifier(self: &Arc<Self>) -> Arc<dyn ServerCertVerifier> {
        Arc::new(DelegatingServerVerifier {
            validator: Arc::clone(self),
        })
    }

    /// Verifier for peer-is-client handshakes (install in a server config).
    pub fn client_verifier(self: &Arc<Self>) -> Arc<dyn ClientCertVerifier> {
        Arc::new(DelegatingClientVerifier {
            validator: Arc::clone(self),
        })
    }

    /// Number of trust anchors in the current generation.
    pub fn anchor_count(&self) -> usize {
        self.delegates.load().roots.len()
    }

    fn rebuild(&self) -> Result<()> {
        let delegates = build_delegates(&self.store)?;
        self.delegates.store(Arc::new(delegates));
        Ok(())
    }
}

impl ReloadListener for ReloadableTrustValidator {
    fn underlying_stores(&self) -> Vec<Arc<DynamicCredentialStore>> {
        vec![Arc::clone(&self.store)]
    }

    fn on_reloaded(&self) -> std::result::Result<(), BoxError> {
        match self.rebuild() {
            Ok(()) => {
                info!("reloaded trust validator {self:?}");
                Ok(())
            }
            Err(err) => {
                error!("could not reload trust validator {self:?}: {err}");
                Err(err.into())
            }
        }
    }
}

fn build_delegates(store: &DynamicCredentialStore) -> Result<TrustDelegates> {
    let roots = build_trust_anchors(store)?;
    let provider = signing_provider()?;

    let server = WebPkiServerVerifier::builder_with_provider(Arc::clone(&roots), Arc::clone(provider))
        .build()
        .map_err(|err| Error::VerifierBuilder(format!("{err:?}")))?;
    let client = WebPkiClientVerifier::builder_with_provider(Arc::clone(&roots), Arc::clone(provider))
        .build()
        .map_err(|err| Error::VerifierBuilder(format!("{err:?}")))?;

    Ok(TrustDelegates {
        roots,
        server,
        client,
    })
}

/// Forwards peer-is-server verification to the validator's current delegate.
struct DelegatingServerVerifier {
    validator: Arc<ReloadableTrustValidator>,
}

impl std::fmt::Debug for DelegatingServerVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegatingServerVerifier").finish()
    }
}

impl ServerCertVerifier for DelegatingServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        self.validator.delegates.load().server.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        )
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.validator
            .delegates
            .load()
            .server
            .verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.validator
            .delegates
            .load()
            .server
            .verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.validator
            .delegates
            .load()
            .server
            .supported_verify_schemes()
    }
}

/// Forwards peer-is-client verification to the validator's current delegate.
struct DelegatingClientVerifier {
    validator: Arc<ReloadableTrustValidator>,
}

impl std::fmt::Debug for DelegatingClientVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegatingClientVerifier").finish()
    }
}

impl ClientCertVerifier for DelegatingClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        // An empty hint list only affects what the peer might offer; it does
        // not weaken verification, and it avoids returning a borrow into the
        // swappable delegate.
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        self.validator
            .delegates
            .load()
            .client
            .verify_client_cert(end_entity, intermediates, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.validator
            .delegates
            .load()
            .client
            .verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.validator
            .delegates
            .load()
            .client
            .verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.validator
            .delegates
            .load()
            .client
            .supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use credwatch::FormatRegistry;
    use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
    use std::fs;
    use std::path::Path;

    struct TestPki {
        ca_pem: String,
        leaf_der: CertificateDer<'static>,
    }

    fn test_pki(leaf_name: &str) -> TestPki {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.distinguished_name.push(DnType::CommonName, "test-ca");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = KeyPair::generate().unwrap();
        let leaf_params = CertificateParams::new(vec![leaf_name.to_string()]).unwrap();
        let leaf_cert = leaf_params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();

        TestPki {
            ca_pem: ca_cert.pem(),
            leaf_der: leaf_cert.der().clone(),
        }
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
    fn accepts_chains_rooted_in_the_store_anchors() {
        let pki = test_pki("valid.example");

        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("ca.pem");
        fs::write(&data, &pki.ca_pem).unwrap();

        let validator = ReloadableTrustValidator::new(open_store(&data)).unwrap();
        let verifier = validator.server_verifier();

        let name = ServerName::try_from("valid.example").unwrap();
        let result =
            verifier.verify_server_cert(&pki.leaf_der, &[], &name, &[], UnixTime::now());
        assert!(result.is_ok(), "expected acceptance, got {result:?}");
    }

    #[test]
    fn rejects_chains_rooted_elsewhere() {
        let trusted = test_pki("valid.example");
        let stranger = test_pki("valid.example");

        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("ca.pem");
        fs::write(&data, &trusted.ca_pem).unwrap();

        let validator = ReloadableTrustValidator::new(open_store(&data)).unwrap();
        let verifier = validator.server_verifier();

        let name = ServerName::try_from("valid.example").unwrap();
        let result =
            verifier.verify_server_cert(&stranger.leaf_der, &[], &name, &[], UnixTime::now());
        assert!(result.is_err());
    }

    #[test]
    fn reload_switches_to_the_new_anchors() {
        let old_pki = test_pki("rotating.example");
        let new_pki = test_pki("rotating.example");

        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("ca.pem");
        fs::write(&data, &old_pki.ca_pem).unwrap();

        let store = open_store(&data);
        let validator = ReloadableTrustValidator::new(Arc::clone(&store)).unwrap();
        let verifier = validator.server_verifier();
        let name = ServerName::try_from("rotating.example").unwrap();

        assert!(verifier
            .verify_server_cert(&old_pki.leaf_der, &[], &name, &[], UnixTime::now())
            .is_ok());

        fs::write(&data, &new_pki.ca_pem).unwrap();
        store.reload_from_disk().unwrap();
        validator.on_reloaded().unwrap();

        // The very same handles now verify against the rotated anchors.
        assert!(verifier
            .verify_server_cert(&new_pki.leaf_der, &[], &name, &[], UnixTime::now())
            .is_ok());
        assert!(verifier
            .verify_server_cert(&old_pki.leaf_der, &[], &name, &[], UnixTime::now())
            .is_err());
    }

    #[test]
    fn store_without_anchors_fails_construction() {
        // A key-only bundle has no certificate entries and thus no anchors.
        let identity_key = KeyPair::generate().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("key-only.pem");
        fs::write(&data, identity_key.serialize_pem()).unwrap();

        let result = ReloadableTrustValidator::new(open_store(&data));
        assert!(result.is_err());
    }
}
