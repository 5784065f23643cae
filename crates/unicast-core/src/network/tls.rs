//! Loading of TLS material for listeners and client sessions.

use crate::config::TlsConfig;
use crate::error::{Result, RpcError};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// Build the rustls server configuration for a listener.
///
/// Returns `None` when no certificate is configured (plain HTTP). When a CA
/// file is present, clients must present a certificate signed by it.
pub fn server_tls_config(tls: &TlsConfig) -> Result<Option<Arc<ServerConfig>>> {
    let (cert_file, key_file) = match (&tls.cert_file, &tls.key_file) {
        (Some(cert), Some(key)) => (cert, key),
        (None, None) if tls.ca_file.is_none() => return Ok(None),
        _ => {
            return Err(RpcError::Config {
                message: "server TLS needs both cert_file and key_file".to_string(),
            })
        }
    };

    let chain = load_cert_chain(cert_file)?;
    let key = load_private_key(key_file)?;
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| RpcError::Tls {
            message: format!("unsupported protocol versions: {}", e),
        })?;

    let config = match &tls.ca_file {
        Some(ca_file) => {
            let roots = load_root_store(ca_file)?;
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .build()
                .map_err(|e| RpcError::Tls {
                    message: format!(
                        "failed to build client verifier from {}: {}",
                        ca_file.display(),
                        e
                    ),
                })?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(chain, key)
        }
        None => builder.with_no_client_auth().with_single_cert(chain, key),
    }
    .map_err(|e| RpcError::Tls {
        message: format!("invalid server certificate/key: {}", e),
    })?;

    Ok(Some(Arc::new(config)))
}

/// Apply trust roots and client identity to a session builder.
pub fn apply_client_tls(
    mut builder: reqwest::ClientBuilder,
    tls: &TlsConfig,
) -> Result<reqwest::ClientBuilder> {
    if !tls.is_enabled() {
        return Ok(builder);
    }

    builder = builder.use_rustls_tls();

    if let Some(ca_file) = &tls.ca_file {
        let pem = read_file(ca_file)?;
        let certificate = reqwest::Certificate::from_pem(&pem).map_err(|e| RpcError::Tls {
            message: format!("invalid CA certificate {}: {}", ca_file.display(), e),
        })?;
        builder = builder.add_root_certificate(certificate);
    }

    match (&tls.cert_file, &tls.key_file) {
        (Some(cert_file), Some(key_file)) => {
            let mut pem = read_file(cert_file)?;
            pem.push(b'\n');
            pem.extend(read_file(key_file)?);
            let identity = reqwest::Identity::from_pem(&pem).map_err(|e| RpcError::Tls {
                message: format!("invalid client identity {}: {}", cert_file.display(), e),
            })?;
            builder = builder.identity(identity);
        }
        (None, None) => {}
        _ => {
            return Err(RpcError::Config {
                message: "client identity needs both cert_file and key_file".to_string(),
            })
        }
    }

    Ok(builder)
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| RpcError::Tls {
        message: format!("failed to read {}: {}", path.display(), e),
    })
}

fn open(path: &Path) -> Result<BufReader<File>> {
    File::open(path).map(BufReader::new).map_err(|e| RpcError::Tls {
        message: format!("failed to open {}: {}", path.display(), e),
    })
}

fn load_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open(path)?;
    let certificates = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| RpcError::Tls {
            message: format!("failed to parse PEM certs from {}: {}", path.display(), e),
        })?;
    if certificates.is_empty() {
        return Err(RpcError::Tls {
            message: format!("no certificates found in {}", path.display()),
        });
    }
    Ok(certificates)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| RpcError::Tls {
            message: format!("failed to parse private key {}: {}", path.display(), e),
        })?
        .ok_or_else(|| RpcError::Tls {
            message: format!("no private key found in {}", path.display()),
        })
}

fn load_root_store(path: &Path) -> Result<RootCertStore> {
    let certificates = load_cert_chain(path)?;
    let mut roots = RootCertStore::empty();
    let (added, _ignored) = roots.add_parsable_certificates(certificates);
    if added == 0 {
        return Err(RpcError::Tls {
            message: format!("no valid CA certificates found in {}", path.display()),
        });
    }
    Ok(roots)
}
