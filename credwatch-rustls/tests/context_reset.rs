//! In-memory rustls handshakes against a resettable context, end to end
//! through the file observer and coordinator.

use credwatch::{DynamicCredentialStore, FileObserver, FormatRegistry, ReloadCoordinator};
use credwatch_rustls::{
    ReloadableKeySelector, ReloadableTrustValidator, ResettableEngine, ResettableTlsContext,
    SelectorStrategy, TlsEngine, TlsProtocol,
};
use rcgen::{CertificateParams, DnType, KeyPair};
use rustls::pki_types::CertificateDer;
use rustls::ProtocolVersion;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const PATIENCE: Duration = Duration::from_secs(10);

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

/// Moves every pending TLS record from one engine to the other.
fn pump(from: &TlsEngine, to: &TlsEngine) {
    while from.wants_write() {
        let mut wire = Vec::new();
        from.write_tls(&mut wire).unwrap();
        let mut cursor = io::Cursor::new(&wire);
        while (cursor.position() as usize) < wire.len() {
            to.read_tls(&mut cursor).unwrap();
        }
    }
}

fn drive_handshake(client: &TlsEngine, server: &TlsEngine) {
    let mut rounds = 0;
    while (client.is_handshaking() || server.is_handshaking()) && rounds < 64 {
        pump(client, server);
        pump(server, client);
        rounds += 1;
    }
    assert!(!client.is_handshaking(), "client never finished handshaking");
    assert!(!server.is_handshaking(), "server never finished handshaking");
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + PATIENCE;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}

struct Rig {
    _coordinator: Arc<ReloadCoordinator>,
    store: Arc<DynamicCredentialStore>,
    context: Arc<ResettableTlsContext>,
    // Listeners are weak in the coordinator; the rig keeps them alive.
    _selector: Arc<ReloadableKeySelector>,
    _validator: Arc<ReloadableTrustValidator>,
}

fn build_rig(data: &Path, protocol: TlsProtocol) -> Rig {
    let coordinator =
        ReloadCoordinator::start(FileObserver::new(Duration::from_millis(100)).unwrap()).unwrap();
    let store = open_store(data);
    coordinator.register(&store).unwrap();

    let selector = ReloadableKeySelector::with_coordinator(
        Arc::clone(&store),
        SelectorStrategy::Simple,
        &coordinator,
    )
    .unwrap();
    let validator =
        ReloadableTrustValidator::with_coordinator(Arc::clone(&store), &coordinator).unwrap();

    let context = ResettableTlsContext::new(protocol).unwrap();
    context
        .init(&selector, &validator, Some(coordinator.as_ref()))
        .unwrap();

    Rig {
        _coordinator: coordinator,
        store,
        context,
        _selector: selector,
        _validator: validator,
    }
}

fn peer_certificate(engine: &TlsEngine) -> Option<CertificateDer<'static>> {
    engine.with_connection(|conn| {
        conn.peer_certificates()
            .and_then(|certs| certs.first().cloned())
            .map(|cert| cert.into_owned())
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn tls13_reset_closes_outbound_without_wrap_or_unwrap() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("id.pem");
    fs::write(&data, identity_pem("reset-gen-1")).unwrap();

    let rig = build_rig(&data, TlsProtocol::Tls13);
    let client = rig.context.create_client_engine("localhost").unwrap();
    let server = rig.context.create_server_engine().unwrap();
    assert_eq!(rig.context.engine_count(), 2);

    drive_handshake(&client, &server);
    assert_eq!(
        client.negotiated_protocol(),
        Some(ProtocolVersion::TLSv1_3)
    );
    assert!(!client.is_outbound_done());

    // Rewrite the credential file; the observer-driven reload must close the
    // outbound side of both live engines with no wrap/unwrap call from us.
    fs::write(&data, identity_pem("reset-gen-2")).unwrap();

    assert!(
        wait_until(|| client.is_outbound_done() && server.is_outbound_done()).await,
        "engines were never reset after the credential change"
    );
    // The close_notify alert is queued for the peer.
    assert!(client.wants_write());
}

#[tokio::test(flavor = "multi_thread")]
async fn handshakes_after_rotation_present_the_new_certificate() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("id.pem");
    fs::write(&data, identity_pem("cert-gen-1")).unwrap();

    let rig = build_rig(&data, TlsProtocol::Any);

    let client = rig.context.create_client_engine("localhost").unwrap();
    let server = rig.context.create_server_engine().unwrap();
    drive_handshake(&client, &server);
    let first_cert = peer_certificate(&client).expect("server presented no certificate");

    fs::write(&data, identity_pem("cert-gen-2")).unwrap();
    assert!(wait_until(|| rig.store.contains_alias("cert-gen-2")).await);
    // The context resets last in registration order, so once the old client
    // engine is closed, selector and validator have both rebuilt.
    assert!(wait_until(|| client.is_outbound_done()).await);

    // New engines negotiate with the rotated identity and the rotated trust
    // anchors, through the very same context.
    let client = rig.context.create_client_engine("localhost").unwrap();
    let server = rig.context.create_server_engine().unwrap();
    drive_handshake(&client, &server);
    let second_cert = peer_certificate(&client).expect("server presented no certificate");

    assert_ne!(first_cert, second_cert);
}

#[tokio::test(flavor = "multi_thread")]
async fn mutual_tls_is_enforced_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("id.pem");
    fs::write(&data, identity_pem("mtls")).unwrap();

    let rig = build_rig(&data, TlsProtocol::Default);
    let client = rig.context.create_client_engine("localhost").unwrap();
    let server = rig.context.create_server_engine().unwrap();
    drive_handshake(&client, &server);

    // The server saw and verified a client certificate.
    assert!(peer_certificate(&server).is_some());
}
