// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Mutual TLS for the agent <-> broker link.
//!
//! Both sides load their material from a certificate directory:
//!
//! ```text
//! <cert_dir>/ca.pem        CA that signed every peer
//! <cert_dir>/<role>.pem    this peer's certificate chain
//! <cert_dir>/<role>.key    this peer's private key
//! ```
//!
//! The broker requires a client certificate signed by the CA; the agent
//! verifies the broker against the same CA. All configs are built on the
//! ring crypto provider.

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
pub use rustls::pki_types::ServerName;
pub use tokio_rustls::{TlsAcceptor, TlsConnector};

/// TLS setup errors.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid PEM in {what}: {reason}")]
    Pem { what: String, reason: String },

    #[error("no certificates found in {0}")]
    NoCertificates(String),

    #[error("TLS error: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("client verifier: {0}")]
    Verifier(#[from] rustls::server::VerifierBuilderError),

    #[error("invalid server name '{0}'")]
    InvalidServerName(String),
}

/// Client and server configs for one peer.
#[derive(Clone)]
pub struct TlsConfig {
    client: Arc<ClientConfig>,
    server: Arc<ServerConfig>,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig").finish_non_exhaustive()
    }
}

impl TlsConfig {
    /// Load `ca.pem`, `<role>.pem` and `<role>.key` from `cert_dir`.
    pub fn from_cert_dir(cert_dir: impl AsRef<Path>, role: &str) -> Result<Self, TlsError> {
        let dir = cert_dir.as_ref();
        let ca = read_file(&dir.join("ca.pem"))?;
        let cert = read_file(&dir.join(format!("{role}.pem")))?;
        let key = read_file(&dir.join(format!("{role}.key")))?;
        tracing::debug!("loaded TLS material for '{}' from {}", role, dir.display());
        Self::from_pem(&ca, &cert, &key)
    }

    /// Build from in-memory PEM blobs.
    pub fn from_pem(ca_pem: &[u8], cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, TlsError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut roots = RootCertStore::empty();
        for ca in parse_certs(ca_pem, "CA bundle")? {
            roots.add(ca)?;
        }
        let roots = Arc::new(roots);

        let certs = parse_certs(cert_pem, "certificate")?;
        let key = PrivateKeyDer::from_pem_slice(key_pem).map_err(|e| TlsError::Pem {
            what: "private key".into(),
            reason: format!("{e:?}"),
        })?;

        let client = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots.clone())
            .with_client_auth_cert(certs.clone(), key.clone_key())?;

        let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider.clone())
            .build()?;
        let server = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)?;

        Ok(Self {
            client: Arc::new(client),
            server: Arc::new(server),
        })
    }

    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.client.clone())
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.server.clone())
    }
}

/// Parse the DNS name the agent expects in the broker certificate.
pub fn server_name(name: &str) -> Result<ServerName<'static>, TlsError> {
    ServerName::try_from(name.to_string()).map_err(|_| TlsError::InvalidServerName(name.into()))
}

fn read_file(path: &Path) -> Result<Vec<u8>, TlsError> {
    std::fs::read(path).map_err(|source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_certs(pem: &[u8], what: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Pem {
            what: what.into(),
            reason: format!("{e:?}"),
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(what.into()));
    }
    Ok(certs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Pki {
        ca_pem: String,
        ca_cert: rcgen::Certificate,
        ca_key: KeyPair,
    }

    fn make_ca() -> Pki {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_key = KeyPair::generate().unwrap();
        let ca_cert = params.self_signed(&ca_key).unwrap();
        Pki {
            ca_pem: ca_cert.pem(),
            ca_cert,
            ca_key,
        }
    }

    fn make_leaf(pki: &Pki, name: &str) -> (String, String) {
        let params = CertificateParams::new(vec![name.to_string()]).unwrap();
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &pki.ca_cert, &pki.ca_key).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    #[test]
    fn test_from_cert_dir_reads_role_files() {
        let pki = make_ca();
        let (cert, key) = make_leaf(&pki, "agent.local");
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ca.pem"), &pki.ca_pem).unwrap();
        std::fs::write(dir.path().join("agent.pem"), cert).unwrap();
        std::fs::write(dir.path().join("agent.key"), key).unwrap();

        assert!(TlsConfig::from_cert_dir(dir.path(), "agent").is_ok());
        assert!(matches!(
            TlsConfig::from_cert_dir(dir.path(), "broker"),
            Err(TlsError::Read { .. })
        ));
    }

    #[test]
    fn test_empty_ca_rejected() {
        let pki = make_ca();
        let (cert, key) = make_leaf(&pki, "agent.local");
        assert!(matches!(
            TlsConfig::from_pem(b"", cert.as_bytes(), key.as_bytes()),
            Err(TlsError::NoCertificates(_))
        ));
    }

    #[tokio::test]
    async fn test_mutual_tls_handshake() {
        let pki = make_ca();
        let (b_cert, b_key) = make_leaf(&pki, "broker.local");
        let (a_cert, a_key) = make_leaf(&pki, "agent.local");
        let broker =
            TlsConfig::from_pem(pki.ca_pem.as_bytes(), b_cert.as_bytes(), b_key.as_bytes())
                .unwrap();
        let agent =
            TlsConfig::from_pem(pki.ca_pem.as_bytes(), a_cert.as_bytes(), a_key.as_bytes())
                .unwrap();

        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let acceptor = broker.acceptor();
        let server = tokio::spawn(async move {
            let mut stream = acceptor.accept(server_io).await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            stream.flush().await.unwrap();
        });

        let mut stream = agent
            .connector()
            .connect(server_name("broker.local").unwrap(), client_io)
            .await
            .unwrap();
        stream.write_all(b"ping").await.unwrap();
        stream.flush().await.unwrap();
        let mut echo = [0u8; 4];
        stream.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"ping");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_foreign_ca_rejected() {
        let pki = make_ca();
        let rogue = make_ca();
        let (b_cert, b_key) = make_leaf(&pki, "broker.local");
        let (a_cert, a_key) = make_leaf(&rogue, "agent.local");
        let broker =
            TlsConfig::from_pem(pki.ca_pem.as_bytes(), b_cert.as_bytes(), b_key.as_bytes())
                .unwrap();
        let agent =
            TlsConfig::from_pem(rogue.ca_pem.as_bytes(), a_cert.as_bytes(), a_key.as_bytes())
                .unwrap();

        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let acceptor = broker.acceptor();
        let server = tokio::spawn(async move { acceptor.accept(server_io).await.is_ok() });

        let client = agent
            .connector()
            .connect(server_name("broker.local").unwrap(), client_io)
            .await;
        assert!(client.is_err());
        assert!(!server.await.unwrap());
    }
}
