//! TLS acceptor setup.
//!
//! The key store is a single PEM bundle holding the server certificate
//! chain and its private key. Encrypted private keys are not supported;
//! supplying a key-store password for an unencrypted bundle is accepted
//! and ignored (kept for CLI compatibility).

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

#[derive(Debug)]
pub enum TlsError {
    Io(std::io::Error),
    Certificate(String),
    PrivateKey(String),
    Config(String),
}

impl std::fmt::Display for TlsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsError::Io(e) => write!(f, "io error: {}", e),
            TlsError::Certificate(msg) => write!(f, "certificate error: {}", msg),
            TlsError::PrivateKey(msg) => write!(f, "private key error: {}", msg),
            TlsError::Config(msg) => write!(f, "tls config error: {}", msg),
        }
    }
}

impl std::error::Error for TlsError {}

impl From<std::io::Error> for TlsError {
    fn from(e: std::io::Error) -> Self {
        TlsError::Io(e)
    }
}

/// Build a `TlsAcceptor` from a PEM key-store bundle.
pub fn load_tls_acceptor(
    key_store: &Path,
    _key_store_password: Option<&str>,
) -> Result<TlsAcceptor, TlsError> {
    let file = File::open(key_store)?;
    let reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_reader_iter(reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Certificate(format!("failed to parse certificates: {}", e)))?;

    if certs.is_empty() {
        return Err(TlsError::Certificate(format!(
            "no certificates found in {}",
            key_store.display()
        )));
    }

    let file = File::open(key_store)?;
    let reader = BufReader::new(file);
    let key = PrivateKeyDer::from_pem_reader(reader)
        .map_err(|e| TlsError::PrivateKey(format!("failed to parse private key: {}", e)))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TlsError::Config(format!("failed to build tls config: {}", e)))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
