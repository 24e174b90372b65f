// TLS configuration and certificate loading

use crate::error::HarnessError;
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

pub const ALPN_H2: &[u8] = b"h2";
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

fn open(path: &Path) -> Result<BufReader<File>, HarnessError> {
    if path.as_os_str().is_empty() {
        return Err(HarnessError::tls(path, "path is empty"));
    }
    let file = File::open(path).map_err(|e| HarnessError::tls(path, e))?;
    Ok(BufReader::new(file))
}

/// Reads every certificate from a PEM file, leaf first.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, HarnessError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| HarnessError::tls(path, e))?;

    if certs.is_empty() {
        return Err(HarnessError::tls(path, "no certificate found in PEM file"));
    }
    Ok(certs)
}

/// Reads the first PKCS#1, PKCS#8 or SEC1 private key from a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, HarnessError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| HarnessError::tls(path, e))?
        .ok_or_else(|| HarnessError::tls(path, "no private key found in PEM file"))
}

/// Builds a server config that offers `h2` and `http/1.1` through ALPN.
pub fn server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>, HarnessError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let mut config =
        ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| HarnessError::tls(cert_path, e))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| HarnessError::tls(key_path, e))?;

    config.alpn_protocols = vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()];

    Ok(Arc::new(config))
}
