//! TLS contexts shared by sessions.
//!
//! A [`TlsContext`] is built once at startup and handed to every session that
//! needs it. It is never mutated afterwards; cloning only bumps the `Arc`s.

use crate::error::ProxyError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct TlsContext {
    client: Option<Arc<ClientConfig>>,
    server: Option<Arc<ServerConfig>>,
}

impl TlsContext {
    pub fn client(config: Arc<ClientConfig>) -> Self {
        Self {
            client: Some(config),
            server: None,
        }
    }

    pub fn server(config: Arc<ServerConfig>) -> Self {
        Self {
            client: None,
            server: Some(config),
        }
    }

    /// Client context trusting the bundled Mozilla root store.
    pub fn webpki_client() -> Result<Self, ProxyError> {
        Ok(Self::client(Arc::new(create_client_config(&[], true)?)))
    }

    pub fn client_config(&self) -> Option<&Arc<ClientConfig>> {
        self.client.as_ref()
    }

    pub fn server_config(&self) -> Option<&Arc<ServerConfig>> {
        self.server.as_ref()
    }
}

pub fn load_certificates(path: &str) -> Result<Vec<CertificateDer<'static>>, ProxyError> {
    let mut reader = BufReader::new(
        File::open(path)
            .map_err(|e| ProxyError::Config(format!("Failed to open certificate file {}: {}", path, e)))?,
    );

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Config(format!("Failed to read certificate {}: {}", path, e)))?;

    if certs.is_empty() {
        return Err(ProxyError::Config(format!("No valid certificate found in {}", path)));
    }
    Ok(certs)
}

pub fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, ProxyError> {
    let mut reader = BufReader::new(
        File::open(path)
            .map_err(|e| ProxyError::Config(format!("Failed to open private key file {}: {}", path, e)))?,
    );

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ProxyError::Config(format!("Failed to read private key {}: {}", path, e)))?
        .ok_or_else(|| ProxyError::Config(format!("No valid private key found in {}", path)))
}

/// Server configuration for the client-facing listener.
pub fn create_server_config(private_key_path: &str, cert_path: &str) -> Result<ServerConfig, ProxyError> {
    let certs = load_certificates(cert_path)?;
    let private_key = load_private_key(private_key_path)?;

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, private_key)
        .map_err(|e| ProxyError::TlsConfig(format!("Failed to create server TLS config: {}", e)))
}

/// Client configuration for origin-facing connections.
///
/// Trust anchors are the union of `ca_paths` and, when requested, the
/// bundled webpki roots.
pub fn create_client_config(ca_paths: &[String], use_webpki_roots: bool) -> Result<ClientConfig, ProxyError> {
    let mut roots = RootCertStore::empty();
    if use_webpki_roots {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    for path in ca_paths {
        for cert in load_certificates(path)? {
            roots
                .add(cert)
                .map_err(|e| ProxyError::TlsConfig(format!("Invalid CA certificate in {}: {}", path, e)))?;
        }
    }

    if roots.is_empty() {
        return Err(ProxyError::TlsConfig("Upstream TLS has no trust anchors".to_string()));
    }

    Ok(ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}
