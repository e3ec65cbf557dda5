// TLS termination for the relay listener.
//
// Loads a PEM certificate chain and private key once at startup and builds a
// `TlsAcceptor`. Connection tasks wrap the accepted TCP stream with it before
// the WebSocket handshake. No client authentication.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::error::RelayError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

pub fn acceptor(config: &TlsConfig) -> Result<TlsAcceptor, RelayError> {
    info!(cert = %config.cert_path.display(), "loading TLS certificate and key");
    let certs = load_certs(&config.cert_path)?;
    let key = load_key(&config.key_path)?;
    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| RelayError::Tls(e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn open(path: &Path, what: &str) -> Result<BufReader<File>, RelayError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| RelayError::Tls(format!("failed to open {what} file {}: {e}", path.display())))
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, RelayError> {
    let mut reader = open(path, "certificate")?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| RelayError::Tls(format!("bad certificate file {}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(RelayError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, RelayError> {
    let mut reader = open(path, "private key")?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| RelayError::Tls(format!("bad private key file {}: {e}", path.display())))?
        .ok_or_else(|| RelayError::Tls(format!("no private key found in {}", path.display())))
}
