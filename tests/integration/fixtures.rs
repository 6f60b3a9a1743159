// tests/integration/fixtures.rs

//! Common test fixtures
//!
//! TLS material for the secured-connection tests: a `localhost` certificate
//! and its CA generated with `rcgen`, the acceptor a mock server serves the
//! certificate with, and the PEM file a client can trust the CA through.

use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use spineldb_client::config::TlsConfig;
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio_rustls::TlsAcceptor;

/// Common test keys and values
pub const TEST_KEY: &str = "k";
pub const TEST_VALUE: &str = "v";

/// A `localhost` identity, issued by its own throwaway CA (or by itself).
pub struct TestCert {
    pub cert_der: CertificateDer<'static>,
    pub cert_pem: String,
    pub key_der: Vec<u8>,
    pub key_pem: String,
    /// The issuing certificate, usable as a trust anchor.
    pub ca_der: CertificateDer<'static>,
    /// The issuing certificate written to disk as a PEM trust store.
    pub cert_file: NamedTempFile,
}

fn pem_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("create PEM file");
    file.write_all(contents.as_bytes()).expect("write PEM file");
    file.flush().expect("flush PEM file");
    file
}

impl TestCert {
    /// Generates a CA and a leaf certificate whose only subject name is
    /// `localhost`.
    pub fn localhost() -> Self {
        let mut ca_params = CertificateParams::new(Vec::<String>::new()).expect("CA params");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "spineldb test CA");
        let ca_key = KeyPair::generate().expect("CA key");
        let ca_cert = ca_params.self_signed(&ca_key).expect("CA certificate");

        let leaf_params =
            CertificateParams::new(vec!["localhost".to_string()]).expect("leaf params");
        let leaf_key = KeyPair::generate().expect("leaf key");
        let leaf_cert = leaf_params
            .signed_by(&leaf_key, &ca_cert, &ca_key)
            .expect("leaf certificate");

        Self {
            cert_der: leaf_cert.der().clone(),
            cert_pem: leaf_cert.pem(),
            key_der: leaf_key.serialize_der(),
            key_pem: leaf_key.serialize_pem(),
            ca_der: ca_cert.der().clone(),
            cert_file: pem_file(&ca_cert.pem()),
        }
    }

    /// A certificate for `localhost` that signs itself, with no CA behind it.
    pub fn self_signed() -> Self {
        let rcgen::CertifiedKey { cert, key_pair } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
                .expect("generate self-signed certificate");
        Self {
            cert_der: cert.der().clone(),
            cert_pem: cert.pem(),
            key_der: key_pair.serialize_der(),
            key_pem: key_pair.serialize_pem(),
            ca_der: cert.der().clone(),
            cert_file: pem_file(&cert.pem()),
        }
    }

    /// The path of the PEM file holding the issuing certificate.
    pub fn cert_path(&self) -> String {
        self.cert_file.path().to_string_lossy().into_owned()
    }

    /// This identity as one PEM file: the certificate followed by the private
    /// key, encrypted as PKCS#8 PBES2 when a password is given.
    pub fn identity_file(&self, password: Option<&str>) -> NamedTempFile {
        let key_pem = match password {
            Some(password) => {
                let info = pkcs8::PrivateKeyInfo::try_from(self.key_der.as_slice())
                    .expect("parse PKCS#8 key");
                let params = pkcs8::pkcs5::pbes2::Parameters::pbkdf2_sha256_aes256cbc(
                    2048, &[7u8; 16], &[9u8; 16],
                )
                .expect("PBES2 parameters");
                info.encrypt_with_params(params, password)
                    .expect("encrypt key")
                    .to_pem("ENCRYPTED PRIVATE KEY", pkcs8::der::pem::LineEnding::LF)
                    .expect("encode encrypted key")
                    .to_string()
            }
            None => self.key_pem.clone(),
        };
        pem_file(&format!("{}{}", self.cert_pem, key_pem))
    }

    /// A server-side acceptor presenting this certificate.
    pub fn acceptor(&self) -> TlsAcceptor {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .expect("protocol versions")
            .with_no_client_auth()
            .with_single_cert(vec![self.cert_der.clone()], self.private_key())
            .expect("server certificate");
        TlsAcceptor::from(Arc::new(config))
    }

    /// Like [`acceptor`](Self::acceptor), but the client must present a
    /// certificate issued by `client_ca`.
    pub fn acceptor_requiring_client(&self, client_ca: &TestCert) -> TlsAcceptor {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut roots = RootCertStore::empty();
        roots.add(client_ca.ca_der.clone()).expect("client CA");
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()
            .expect("client verifier");
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .expect("protocol versions")
            .with_client_cert_verifier(verifier)
            .with_single_cert(vec![self.cert_der.clone()], self.private_key())
            .expect("server certificate");
        TlsAcceptor::from(Arc::new(config))
    }

    fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }
}

/// TLS settings with endpoint identification off and no trust store.
pub fn insecure_tls() -> TlsConfig {
    TlsConfig {
        endpoint_identification: false,
        ..TlsConfig::default()
    }
}

/// TLS settings trusting the CA that issued `cert`.
pub fn trusting(cert: &TestCert, endpoint_identification: bool) -> TlsConfig {
    TlsConfig {
        truststore_path: Some(cert.cert_path()),
        endpoint_identification,
        ..TlsConfig::default()
    }
}
