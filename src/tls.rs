//! TLS configuration.
//!
//! The server presents a PEM certificate chain and private key. The client
//! trusts exactly the certificates it is given (typically the server's own
//! self-signed certificate) and nothing else: no system roots are loaded.

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// TLS setup errors.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed PEM: {0}")]
    Pem(#[source] io::Error),

    #[error("no certificates found in PEM input")]
    NoCertificates,

    #[error("no private key found in PEM input")]
    NoPrivateKey,

    #[error("invalid server name '{0}'")]
    InvalidServerName(String),

    #[error("rustls: {0}")]
    Rustls(#[from] rustls::Error),
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn read_file(path: &Path) -> Result<Vec<u8>, TlsError> {
    std::fs::read(path).map_err(|source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Parse every certificate in a PEM document.
pub fn certs_from_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(TlsError::Pem)?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates);
    }
    Ok(certs)
}

/// Parse the first private key (PKCS#1, PKCS#8 or SEC1) in a PEM document.
pub fn private_key_from_pem(pem: &[u8]) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(TlsError::Pem)?
        .ok_or(TlsError::NoPrivateKey)
}

/// Build a server config presenting `certs` with `key`. No client auth.
pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>, TlsError> {
    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(Arc::new(config))
}

/// Build a client config whose only trust anchors are `anchors`.
pub fn client_config(
    anchors: Vec<CertificateDer<'static>>,
) -> Result<Arc<ClientConfig>, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in anchors {
        roots.add(cert)?;
    }

    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(Arc::new(config))
}

/// Load the server config from PEM files on disk.
pub fn load_server_config(cert: &Path, key: &Path) -> Result<Arc<ServerConfig>, TlsError> {
    let certs = certs_from_pem(&read_file(cert)?)?;
    let key = private_key_from_pem(&read_file(key)?)?;
    debug!(cert = %cert.display(), chain_len = certs.len(), "Loaded server certificate");
    server_config(certs, key)
}

/// Load the client config trusting only the certificates in `ca_cert`.
pub fn load_client_config(ca_cert: &Path) -> Result<Arc<ClientConfig>, TlsError> {
    let anchors = certs_from_pem(&read_file(ca_cert)?)?;
    debug!(ca_cert = %ca_cert.display(), anchors = anchors.len(), "Loaded trust anchors");
    client_config(anchors)
}

/// Validate a DNS name or IP address for SNI and certificate verification.
pub fn server_name(name: &str) -> Result<ServerName<'static>, TlsError> {
    ServerName::try_from(name.to_string())
        .map_err(|_| TlsError::InvalidServerName(name.to_string()))
}
