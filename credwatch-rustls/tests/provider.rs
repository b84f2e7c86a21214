//! Provider lifecycle and algorithm-name resolution.
//!
//! The provider slot is process-global, so the whole lifecycle runs as one
//! test.

use credwatch_rustls::{
    lookup_tls_context, Error, InstallPosition, ReloadProvider, ALGO_KEYSTORE,
    ALGO_KEY_SELECTOR_PKIX, ALGO_KEY_SELECTOR_X509, ALGO_TRUST_VALIDATOR_PKIX,
    ALGO_TRUST_VALIDATOR_SIMPLE,
};
use rcgen::{CertificateParams, DnType, KeyPair};
use std::fs;
use std::time::Duration;

fn identity_pem(common_name: &str) -> String {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    let cert = params.self_signed(&key).unwrap();
    format!("{}{}", key.serialize_pem(), cert.pem())
}

#[tokio::test(flavor = "multi_thread")]
async fn provider_lifecycle_and_algorithm_surface() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("id.pem");
    fs::write(&data, identity_pem("provider")).unwrap();
    let descriptor = format!("location={}\nkeystore.algorithm=PEM\n", data.display());

    assert!(!ReloadProvider::is_enabled());
    assert!(matches!(ReloadProvider::disable(), Err(Error::NotEnabled)));

    // --- tail position ---
    let provider = ReloadProvider::builder()
        .event_buffer_window(Duration::from_millis(50))
        .enable_last()
        .unwrap();
    assert!(ReloadProvider::is_enabled());
    assert_eq!(provider.position(), InstallPosition::Last);
    assert!(matches!(
        ReloadProvider::enable_first(),
        Err(Error::AlreadyEnabled)
    ));

    // Store resolution.
    let store = provider
        .open_store(ALGO_KEYSTORE, descriptor.as_bytes(), None)
        .unwrap();
    assert!(store.contains_alias("provider"));
    assert_eq!(provider.coordinator().store_count(), 1);
    assert!(matches!(
        provider.open_store("NoSuchKeystore", descriptor.as_bytes(), None),
        Err(Error::UnknownAlgorithm(_))
    ));

    // Selector and validator resolution.
    let selector = provider
        .key_selector(ALGO_KEY_SELECTOR_X509, &store)
        .unwrap();
    let _sni = provider
        .key_selector(ALGO_KEY_SELECTOR_PKIX, &store)
        .unwrap();
    let validator = provider
        .trust_validator(ALGO_TRUST_VALIDATOR_PKIX, &store)
        .unwrap();
    let _simple = provider
        .trust_validator(ALGO_TRUST_VALIDATOR_SIMPLE, &store)
        .unwrap();
    assert!(matches!(
        provider.key_selector("NoSuchSelector", &store),
        Err(Error::UnknownAlgorithm(_))
    ));
    assert!(provider.coordinator().listener_count(&store) >= 4);

    // Context resolution.
    let context = provider.tls_context("TLSv1.3").unwrap();
    context
        .init(&selector, &validator, Some(provider.coordinator().as_ref()))
        .unwrap();
    assert!(matches!(
        provider.tls_context("TLSv1"),
        Err(Error::UnsupportedProtocol(_))
    ));
    assert!(matches!(
        provider.tls_context("bogus"),
        Err(Error::UnknownAlgorithm(_))
    ));

    // Tail position does not intercept the standard names.
    assert!(matches!(
        lookup_tls_context("TLS"),
        Err(Error::UnknownAlgorithm(_))
    ));

    // Operator-initiated global reload sweeps cleanly.
    let failures = provider.force_reload_all();
    assert!(failures.is_empty(), "unexpected failures: {failures:?}");

    ReloadProvider::disable().unwrap();
    assert!(!ReloadProvider::is_enabled());

    // --- head position intercepts standard names ---
    let provider = ReloadProvider::enable_first().unwrap();
    assert_eq!(provider.position(), InstallPosition::First);
    assert!(lookup_tls_context("TLS").is_ok());
    assert!(matches!(
        lookup_tls_context("TLSv1.1"),
        Err(Error::UnsupportedProtocol(_))
    ));

    ReloadProvider::disable().unwrap();
}
