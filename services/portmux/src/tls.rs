//! TLS termination setup.
//!
//! Loads a PEM certificate chain and private key and builds a rustls
//! [`ServerConfig`] on the ring provider, advertising `h2` and `http/1.1`
//! over ALPN so the mux can still tell the decrypted protocols apart.

use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::ring::default_provider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tracing::{debug, warn};

use crate::error::{MuxError, MuxResult};

/// ALPN protocols offered by [`server_config`].
pub const ALPN_PROTOCOLS: &[&[u8]] = &[b"h2", b"http/1.1"];

/// Build a server config from PEM files.
pub fn server_config(
    cert_file: impl AsRef<Path>,
    key_file: impl AsRef<Path>,
) -> MuxResult<Arc<ServerConfig>> {
    let certs = load_certificates(cert_file.as_ref())?;
    let key = load_private_key(key_file.as_ref())?;

    let mut config = ServerConfig::builder_with_provider(Arc::new(default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| MuxError::Tls(format!("unsupported protocol versions: {e}")))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| MuxError::Tls(format!("failed to configure server cert: {e}")))?;
    config.alpn_protocols = ALPN_PROTOCOLS.iter().map(|p| p.to_vec()).collect();

    Ok(Arc::new(config))
}

/// Load every certificate in a PEM file.
pub fn load_certificates(path: &Path) -> MuxResult<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path).map_err(|e| MuxError::CertificateLoad {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let mut reader = BufReader::new(file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .filter_map(|result| match result {
            Ok(cert) => Some(cert),
            Err(e) => {
                warn!(error = %e, "Skipping invalid certificate");
                None
            }
        })
        .collect();

    if certs.is_empty() {
        return Err(MuxError::NoCertificates(path.display().to_string()));
    }

    debug!(count = certs.len(), path = %path.display(), "Loaded certificates");
    Ok(certs)
}

/// Load the first private key (PKCS#1, PKCS#8 or SEC1) in a PEM file.
pub fn load_private_key(path: &Path) -> MuxResult<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path).map_err(|e| MuxError::PrivateKeyLoad {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let mut reader = BufReader::new(file);
    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => return Ok(PrivateKeyDer::Pkcs1(key)),
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => return Ok(PrivateKeyDer::Pkcs8(key)),
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => return Ok(PrivateKeyDer::Sec1(key)),
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(e) => {
                return Err(MuxError::PrivateKeyLoad {
                    path: path.display().to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    Err(MuxError::NoPrivateKey(path.display().to_string()))
}
