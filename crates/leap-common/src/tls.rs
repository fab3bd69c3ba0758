use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use std::io::Cursor;
use std::path::Path;

use crate::TransportError;

fn read_pem(path: &Path) -> Result<String, TransportError> {
    std::fs::read_to_string(path).map_err(|source| TransportError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Load certificates from PEM content string
pub fn load_certs_from_pem(pem_content: &str) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let mut cursor = Cursor::new(pem_content.as_bytes());
    let certs = certs(&mut cursor)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Certificate(format!("Failed to parse certificates: {}", e)))?;

    if certs.is_empty() {
        return Err(TransportError::Certificate(
            "No certificates found in PEM content".to_string(),
        ));
    }
    Ok(certs)
}

/// Load a private key from PEM content string
pub fn load_private_key_from_pem(pem_content: &str) -> Result<PrivateKeyDer<'static>, TransportError> {
    let mut cursor = Cursor::new(pem_content.as_bytes());
    private_key(&mut cursor)
        .map_err(|e| TransportError::Certificate(format!("Failed to parse private key: {}", e)))?
        .ok_or_else(|| TransportError::Certificate("No private key found in PEM content".to_string()))
}

/// Load the TLS config for the public listener
///
/// The relay terminates TLS itself only when a certificate/key pair is
/// configured; clients are not asked for certificates.
///
/// # Arguments
/// * `cert_path` - Path to the certificate chain PEM file
/// * `key_path` - Path to the private key PEM file
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig, TransportError> {
    let certs = load_certs_from_pem(&read_pem(cert_path)?)?;
    let key = load_private_key_from_pem(&read_pem(key_path)?)?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls(format!("Failed to build server config: {}", e)))?;

    // The channel handshake is an HTTP/1.1 upgrade
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(config)
}
