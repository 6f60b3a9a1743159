// tests/integration/tls_test.rs

//! Secured connections: trust resolution, handshake gating and failures.

use super::fixtures::{TestCert, insecure_tls, trusting};
use super::test_helpers::{MockServer, test_config};
use spineldb_client::config::{Address, TlsConfig, TlsProvider};
use spineldb_client::connection::{ConnectionInitializer, TrustMode};
use spineldb_client::core::protocol::{Command, ConnectionKind, RespFrame};
use spineldb_client::core::{ClientError, ErrorKind};

fn initializer(address: Address, tls: TlsConfig) -> ConnectionInitializer {
    ConnectionInitializer::new(test_config(address).with_tls(tls)).unwrap()
}

#[tokio::test]
async fn test_accept_all_connects_to_self_signed_server() {
    let cert = TestCert::self_signed();
    let server = MockServer::start_tls(cert.acceptor()).await;
    let init = initializer(Address::secure("localhost", server.port()), insecure_tls());
    assert_eq!(init.tls().unwrap().trust_mode(), TrustMode::AcceptAll);

    let conn = init.connect(ConnectionKind::Plain).await.unwrap();
    assert!(conn.is_ready());
    let reply = conn.send(Command::new("SET").arg("k").arg("v")).await.unwrap();
    assert_eq!(reply, RespFrame::SimpleString("OK".into()));
    assert_eq!(
        conn.send(Command::new("GET").arg("k")).await.unwrap(),
        RespFrame::BulkString("v".into())
    );
}

#[tokio::test]
async fn test_alternate_provider_completes_handshake() {
    let cert = TestCert::localhost();
    let server = MockServer::start_tls(cert.acceptor()).await;
    let tls = TlsConfig {
        provider: TlsProvider::Alternate,
        ..insecure_tls()
    };
    let init = initializer(Address::secure("127.0.0.1", server.port()), tls);
    assert_eq!(init.tls().unwrap().provider(), TlsProvider::Alternate);

    let conn = init.connect(ConnectionKind::Plain).await.unwrap();
    assert_eq!(conn.ping().await.unwrap(), "PONG");
}

#[tokio::test]
async fn test_trust_store_with_matching_hostname() {
    let cert = TestCert::localhost();
    let server = MockServer::start_tls(cert.acceptor()).await;
    let init = initializer(
        Address::secure("localhost", server.port()),
        trusting(&cert, true),
    );
    assert_eq!(init.tls().unwrap().trust_mode(), TrustMode::TrustStore);

    let conn = init.connect(ConnectionKind::Plain).await.unwrap();
    assert_eq!(conn.ping().await.unwrap(), "PONG");
}

#[tokio::test]
async fn test_trust_store_rejects_hostname_mismatch() {
    let cert = TestCert::localhost();
    let server = MockServer::start_tls(cert.acceptor()).await;
    // The certificate only names `localhost`.
    let init = initializer(
        Address::secure("127.0.0.1", server.port()),
        trusting(&cert, true),
    );

    let err = init.connect(ConnectionKind::Plain).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Handshake, "unexpected error {err:?}");
}

#[tokio::test]
async fn test_trust_store_wins_over_disabled_identification() {
    let cert = TestCert::localhost();
    let server = MockServer::start_tls(cert.acceptor()).await;
    let init = initializer(
        Address::secure("127.0.0.1", server.port()),
        trusting(&cert, false),
    );
    assert_eq!(
        init.tls().unwrap().trust_mode(),
        TrustMode::TrustStoreWithoutHostname
    );

    // Chain verified against the trust store, hostname ignored.
    let conn = init.connect(ConnectionKind::Plain).await.unwrap();
    assert_eq!(conn.ping().await.unwrap(), "PONG");
}

#[tokio::test]
async fn test_trust_store_without_identification_still_checks_chain() {
    let trusted = TestCert::localhost();
    let presented = TestCert::localhost();
    let server = MockServer::start_tls(presented.acceptor()).await;
    let init = initializer(
        Address::secure("localhost", server.port()),
        trusting(&trusted, false),
    );

    let err = init.connect(ConnectionKind::Plain).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Handshake);
}

#[tokio::test]
async fn test_web_pki_roots_reject_self_signed_certificate() {
    let cert = TestCert::self_signed();
    let server = MockServer::start_tls(cert.acceptor()).await;
    let init = initializer(
        Address::secure("localhost", server.port()),
        TlsConfig::default(),
    );
    assert_eq!(init.tls().unwrap().trust_mode(), TrustMode::WebPkiRoots);

    let socket = tokio::net::TcpStream::connect(server.addr).await.unwrap();
    let conn = init.initialize(socket, ConnectionKind::Plain);
    let err = conn.ready().await.unwrap_err();
    assert!(matches!(err, ClientError::Handshake(_)));
    assert!(!conn.is_ready());

    // The failed connection never accepts commands.
    let err = conn.send(Command::new("PING")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Handshake);
}

#[tokio::test]
async fn test_tls_client_against_plain_server_fails_handshake() {
    let server = MockServer::start().await;
    let init = initializer(Address::secure("127.0.0.1", server.port()), insecure_tls());

    let err = init.connect(ConnectionKind::Plain).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Handshake);
}

#[tokio::test]
async fn test_missing_trust_store_file_fails_context_build() {
    let tls = TlsConfig {
        truststore_path: Some("/nonexistent/ca.pem".to_string()),
        ..TlsConfig::default()
    };
    let err = ConnectionInitializer::new(
        test_config(Address::secure("localhost", 6380)).with_tls(tls),
    )
    .unwrap_err();
    assert!(matches!(err, ClientError::Tls(_)));
}

#[tokio::test]
async fn test_plain_address_has_no_tls_context() {
    let init = initializer(Address::plain("127.0.0.1", 6379), insecure_tls());
    assert!(init.tls().is_none());
}

fn with_identity(tls: TlsConfig, identity: &tempfile::NamedTempFile, password: Option<&str>) -> TlsConfig {
    TlsConfig {
        keystore_path: Some(identity.path().to_string_lossy().into_owned()),
        keystore_password: password.map(str::to_string),
        ..tls
    }
}

#[tokio::test]
async fn test_encrypted_client_identity_authenticates() {
    let server_cert = TestCert::localhost();
    let client_cert = TestCert::localhost();
    let server =
        MockServer::start_tls(server_cert.acceptor_requiring_client(&client_cert)).await;
    let identity = client_cert.identity_file(Some("s3cret"));
    let tls = with_identity(trusting(&server_cert, true), &identity, Some("s3cret"));

    let init = initializer(Address::secure("localhost", server.port()), tls);
    let conn = init.connect(ConnectionKind::Plain).await.unwrap();
    assert_eq!(conn.ping().await.unwrap(), "PONG");
}

#[tokio::test]
async fn test_encrypted_identity_with_wrong_password_fails_context_build() {
    let cert = TestCert::localhost();
    let identity = cert.identity_file(Some("s3cret"));
    let tls = with_identity(insecure_tls(), &identity, Some("guess"));

    let err = ConnectionInitializer::new(
        test_config(Address::secure("localhost", 6380)).with_tls(tls),
    )
    .unwrap_err();
    assert!(matches!(err, ClientError::Tls(ref msg) if msg.contains("decrypt")), "{err}");
}

#[tokio::test]
async fn test_encrypted_identity_without_password_fails_context_build() {
    let cert = TestCert::localhost();
    let identity = cert.identity_file(Some("s3cret"));
    let tls = with_identity(insecure_tls(), &identity, None);

    let err = ConnectionInitializer::new(
        test_config(Address::secure("localhost", 6380)).with_tls(tls),
    )
    .unwrap_err();
    assert!(
        matches!(err, ClientError::Tls(ref msg) if msg.contains("keystore_password")),
        "{err}"
    );
}

#[tokio::test]
async fn test_plain_identity_loads_with_or_without_password() {
    let cert = TestCert::localhost();
    let identity = cert.identity_file(None);
    for password in [None, Some("unused")] {
        let tls = with_identity(insecure_tls(), &identity, password);
        assert!(
            ConnectionInitializer::new(
                test_config(Address::secure("localhost", 6380)).with_tls(tls)
            )
            .is_ok()
        );
    }
}
