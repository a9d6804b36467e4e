//! TLS configuration derived from certificate material.
//!
//! Builds the rustls server config for the worker's listener (client
//! certificates required and verified against the trust domain root) and
//! the reqwest identity and root used for outbound mTLS.

use std::io::BufReader;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use zeroize::Zeroizing;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("invalid PEM: {0}")]
    Pem(String),

    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("client verifier: {0}")]
    Verifier(String),

    #[error("HTTP client: {0}")]
    Client(String),
}

/// Certificate chain, private key and trust anchor for one identity.
#[derive(Clone)]
pub struct TlsConfig {
    chain_pem: String,
    key_pem: Zeroizing<String>,
    ca_pem: String,
}

impl TlsConfig {
    pub fn new(chain_pem: String, key_pem: Zeroizing<String>, ca_pem: String) -> Self {
        Self {
            chain_pem,
            key_pem,
            ca_pem,
        }
    }

    pub fn chain_pem(&self) -> &str {
        &self.chain_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    pub fn ca_pem(&self) -> &str {
        &self.ca_pem
    }

    /// Client identity for reqwest: key followed by the certificate chain.
    pub fn reqwest_identity(&self) -> Result<reqwest::Identity, TlsError> {
        let mut pem = Zeroizing::new(Vec::with_capacity(
            self.key_pem.len() + self.chain_pem.len() + 1,
        ));
        pem.extend_from_slice(self.key_pem.as_bytes());
        pem.push(b'\n');
        pem.extend_from_slice(self.chain_pem.as_bytes());
        reqwest::Identity::from_pem(&pem).map_err(|e| TlsError::Client(e.to_string()))
    }

    /// The trust anchor as a reqwest root certificate.
    pub fn reqwest_root(&self) -> Result<reqwest::Certificate, TlsError> {
        reqwest::Certificate::from_pem(self.ca_pem.as_bytes())
            .map_err(|e| TlsError::Client(e.to_string()))
    }

    /// Server config that requires clients to present a certificate issued
    /// by the same root.
    pub fn server_config(&self) -> Result<ServerConfig, TlsError> {
        let provider = provider();

        let mut roots = RootCertStore::empty();
        for ca in parse_certs(&self.ca_pem)? {
            roots.add(ca)?;
        }
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()
            .map_err(|e| TlsError::Verifier(e.to_string()))?;

        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(verifier)
            .with_single_cert(parse_certs(&self.chain_pem)?, parse_key(&self.key_pem)?)?;
        config.alpn_protocols = alpn();
        Ok(config)
    }
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig").finish_non_exhaustive()
    }
}

/// Server config without client authentication, for the CA's own
/// listener (workers have no certificate yet when they call it).
pub fn server_config_without_client_auth(
    chain_pem: &str,
    key_pem: &str,
) -> Result<ServerConfig, TlsError> {
    let mut config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(parse_certs(chain_pem)?, parse_key(key_pem)?)?;
    config.alpn_protocols = alpn();
    Ok(config)
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn alpn() -> Vec<Vec<u8>> {
    vec![b"h2".to_vec(), b"http/1.1".to_vec()]
}

fn parse_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem.as_bytes()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Pem(e.to_string()))?;
    if certs.is_empty() {
        return Err(TlsError::Pem("no certificates found".into()));
    }
    Ok(certs)
}

fn parse_key(pem: &str) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut BufReader::new(pem.as_bytes()))
        .map_err(|e| TlsError::Pem(e.to_string()))?
        .ok_or_else(|| TlsError::Pem("no private key found".into()))
}
